use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, Subscription, WatchError};
use chrono::Utc;
use crewscope_core::wire::DEFAULT_MAX_FRAME_BYTES;
use crewscope_core::{
    build_graph, consistency_warnings, ConsistencyWarning, CrewDefinition, CrewRunId,
    ExecutionState, GraphModel, Normalizer,
};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Read-only copy of a run handed to renderers.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct RunSnapshot {
    pub crew_run_id: CrewRunId,
    pub generation: u64,
    pub connection: Option<ConnectionState>,
    pub state: ExecutionState,
    pub graph: Option<GraphModel>,
    pub decode_errors: u64,
    pub warnings: Vec<ConsistencyWarning>,
}

/// State of one subscription. Never reused across subscriptions: a new transport always
/// gets a new session.
pub struct RunSession {
    subscription: Subscription,
    definition: Option<CrewDefinition>,
    state: ExecutionState,
    normalizer: Normalizer,
    connection: Option<ConnectionState>,
    decode_errors: u64,
    reported: BTreeSet<ConsistencyWarning>,
}

impl RunSession {
    pub fn new(
        subscription: Subscription,
        definition: Option<CrewDefinition>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            subscription,
            definition,
            state: ExecutionState::new(),
            normalizer: Normalizer::new(max_frame_bytes),
            connection: Some(ConnectionState::Connecting),
            decode_errors: 0,
            reported: BTreeSet::new(),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn connection(&self) -> Option<ConnectionState> {
        self.connection
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// A run may only be started while its transport is open.
    pub fn can_start(&self) -> bool {
        self.connection == Some(ConnectionState::Open)
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() || self.connection.map(|c| c.is_settled()).unwrap_or(false)
    }

    pub fn apply(&mut self, event: ConnectionEvent) {
        let crew_run_id = self.subscription.crew_run_id.as_str();
        match event {
            ConnectionEvent::Connecting => self.connection = Some(ConnectionState::Connecting),
            ConnectionEvent::Opened => {
                info!(crew_run_id, "run_connection_open");
                self.connection = Some(ConnectionState::Open);
            }
            ConnectionEvent::Closed(reason) => {
                info!(crew_run_id, "run_connection_closed: {reason}");
                self.connection = Some(ConnectionState::Closed);
            }
            ConnectionEvent::Errored(cause) => {
                warn!(crew_run_id, "run_connection_error: {cause}");
                self.connection = Some(ConnectionState::Errored);
            }
            ConnectionEvent::Message(raw) => self.apply_frame(&raw),
        }
    }

    fn apply_frame(&mut self, raw: &str) {
        let message = match self.normalizer.normalize(raw, Utc::now()) {
            Ok(message) => message,
            Err(err) => {
                self.decode_errors += 1;
                warn!(crew_run_id = %self.subscription.crew_run_id, "frame_decode_error: {err}");
                return;
            }
        };
        debug!(
            index = message.index,
            kind = message.kind().as_str(),
            "frame_applied"
        );
        self.state.apply(&message);
        self.report_new_warnings();
    }

    fn report_new_warnings(&mut self) {
        let Some(definition) = &self.definition else {
            return;
        };
        for warning in consistency_warnings(definition, &self.state) {
            if self.reported.insert(warning.clone()) {
                warn!(crew_run_id = %self.subscription.crew_run_id, "consistency_warning: {warning}");
            }
        }
    }

    pub fn graph(&self) -> Option<GraphModel> {
        self.definition
            .as_ref()
            .map(|definition| build_graph(definition, &self.state))
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            crew_run_id: self.subscription.crew_run_id.clone(),
            generation: self.subscription.generation,
            connection: self.connection,
            state: self.state.clone(),
            graph: self.graph(),
            decode_errors: self.decode_errors,
            warnings: self.reported.iter().cloned().collect(),
        }
    }
}

/// Drives a [`ConnectionManager`] and folds its events into the current [`RunSession`],
/// publishing a fresh [`RunSnapshot`] after each one.
pub struct RunWatcher {
    manager: ConnectionManager,
    definition: Option<CrewDefinition>,
    max_frame_bytes: usize,
    session: Option<RunSession>,
    snapshots: watch::Sender<RunSnapshot>,
}

impl RunWatcher {
    pub fn new(ws_base: Url, definition: Option<CrewDefinition>) -> Self {
        let (snapshots, _) = watch::channel(RunSnapshot::default());
        Self {
            manager: ConnectionManager::new(ws_base),
            definition,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            session: None,
            snapshots,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn snapshots(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn session(&self) -> Option<&RunSession> {
        self.session.as_ref()
    }

    pub async fn watch(&mut self, crew_run_id: &str) -> Result<Subscription, WatchError> {
        let subscription = self.manager.subscribe(crew_run_id).await?;
        let reused = self
            .session
            .as_ref()
            .map(|session| session.subscription() == &subscription)
            .unwrap_or(false);
        if !reused {
            self.session = Some(RunSession::new(
                subscription.clone(),
                self.definition.clone(),
                self.max_frame_bytes,
            ));
            self.publish();
        }
        Ok(subscription)
    }

    /// Applies the next transport event. Returns `false` once the transport has stopped.
    pub async fn next(&mut self) -> bool {
        let Some(event) = self.manager.next_event().await else {
            return false;
        };
        if let Some(session) = self.session.as_mut() {
            session.apply(event);
        }
        self.publish();
        true
    }

    /// Waits until the transport opens or settles. Returns whether a run may be started.
    pub async fn wait_until_open(&mut self) -> bool {
        loop {
            match self.session.as_ref() {
                Some(session) if session.can_start() => return true,
                Some(session) if session.is_finished() => return false,
                None => return false,
                _ => {}
            }
            if !self.next().await {
                return false;
            }
        }
    }

    pub async fn stop(&mut self) {
        self.manager.unsubscribe().await;
        if let Some(session) = self.session.as_mut() {
            if !session.connection().map(|c| c.is_settled()).unwrap_or(false) {
                session.apply(ConnectionEvent::Closed("unsubscribed".to_string()));
            }
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(session) = &self.session {
            self.snapshots.send_replace(session.snapshot());
        }
    }
}
