use crate::config::{crew_ws_url, ConfigError};
use crewscope_core::CrewRunId;
use futures_util::StreamExt;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("crew run id must not be empty")]
    EmptyCrewRunId,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Opened,
    Message(String),
    Closed(String),
    Errored(String),
}

/// Identifies one transport. `generation` changes every time a new transport is opened,
/// even for the same crew run id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub crew_run_id: CrewRunId,
    pub generation: u64,
}

struct ActiveSubscription {
    subscription: Subscription,
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
    events: mpsc::Receiver<ConnectionEvent>,
}

/// Owns at most one real-time transport at a time.
pub struct ConnectionManager {
    ws_base: Url,
    active: Option<ActiveSubscription>,
    state: Option<ConnectionState>,
    generation: u64,
    event_capacity: usize,
}

impl ConnectionManager {
    pub fn new(ws_base: Url) -> Self {
        Self {
            ws_base,
            active: None,
            state: None,
            generation: 0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.active.as_ref().map(|active| &active.subscription)
    }

    /// Opens a transport for `crew_run_id`. Asking again for the run that is already
    /// connecting or open returns the existing subscription; any other id first tears the
    /// current transport down.
    pub async fn subscribe(&mut self, crew_run_id: &str) -> Result<Subscription, WatchError> {
        let crew_run_id = crew_run_id.trim();
        if crew_run_id.is_empty() {
            return Err(WatchError::EmptyCrewRunId);
        }
        if let Some(active) = &self.active {
            let live = !self.state.map(|state| state.is_settled()).unwrap_or(false);
            if live && active.subscription.crew_run_id == crew_run_id {
                return Ok(active.subscription.clone());
            }
        }
        let url = crew_ws_url(&self.ws_base, crew_run_id)?;
        self.unsubscribe().await;

        self.generation += 1;
        let subscription = Subscription {
            crew_run_id: crew_run_id.to_string(),
            generation: self.generation,
        };
        let (event_tx, events) = mpsc::channel(self.event_capacity);
        let (cancel, cancel_rx) = oneshot::channel();
        info!(
            crew_run_id = %subscription.crew_run_id,
            generation = subscription.generation,
            "crew_subscribe: {url}"
        );
        let task = tokio::spawn(transport_loop(url, event_tx, cancel_rx));
        self.active = Some(ActiveSubscription {
            subscription: subscription.clone(),
            cancel,
            task,
            events,
        });
        self.state = Some(ConnectionState::Connecting);
        Ok(subscription)
    }

    /// Next event of the current transport, or `None` once it has stopped or when nothing
    /// is subscribed. Cancel safe.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        let active = self.active.as_mut()?;
        let event = active.events.recv().await?;
        match &event {
            ConnectionEvent::Connecting => self.state = Some(ConnectionState::Connecting),
            ConnectionEvent::Opened => self.state = Some(ConnectionState::Open),
            ConnectionEvent::Closed(_) => self.state = Some(ConnectionState::Closed),
            ConnectionEvent::Errored(_) => self.state = Some(ConnectionState::Errored),
            ConnectionEvent::Message(_) => {}
        }
        Some(event)
    }

    /// Closes the transport if one exists. Frames not yet consumed are dropped.
    pub async fn unsubscribe(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveSubscription {
            subscription,
            cancel,
            task,
            events,
        } = active;
        let _ = cancel.send(());
        drop(events);
        if let Err(err) = task.await {
            warn!("crew_transport_join_error: {err}");
        }
        self.state = Some(ConnectionState::Closed);
        info!(
            crew_run_id = %subscription.crew_run_id,
            generation = subscription.generation,
            "crew_unsubscribe"
        );
    }
}

async fn transport_loop(
    url: Url,
    events: mpsc::Sender<ConnectionEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    if events.send(ConnectionEvent::Connecting).await.is_err() {
        return;
    }
    let connect = tokio::select! {
        _ = &mut cancel => return,
        connect = connect_async(url.clone()) => connect,
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            warn!("crew_connect_error: {err}");
            let _ = events.send(ConnectionEvent::Errored(err.to_string())).await;
            return;
        }
    };
    info!("crew_connected: {url}");
    if events.send(ConnectionEvent::Opened).await.is_err() {
        let _ = ws.close(None).await;
        return;
    }

    loop {
        tokio::select! {
            _ = &mut cancel => {
                let _ = ws.close(None).await;
                return;
            }
            next = ws.next() => {
                let terminal = match next {
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.trim().is_empty())
                            .unwrap_or_else(|| "closed by engine".to_string());
                        info!("crew_closed: {reason}");
                        Some(ConnectionEvent::Closed(reason))
                    }
                    Some(Ok(msg)) => {
                        if let Some(text) = message_text(msg) {
                            if events.send(ConnectionEvent::Message(text)).await.is_err() {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        None
                    }
                    Some(Err(err)) => {
                        warn!("crew_transport_error: {err}");
                        Some(ConnectionEvent::Errored(err.to_string()))
                    }
                    None => {
                        info!("crew_stream_ended");
                        Some(ConnectionEvent::Closed("stream ended".to_string()))
                    }
                };
                if let Some(event) = terminal {
                    let _ = events.send(event).await;
                    return;
                }
            }
        }
    }
}

fn message_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!("crew_binary_frame_not_utf8: {err}");
                None
            }
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_crew_run_id_is_rejected_synchronously() {
        let mut manager =
            ConnectionManager::new(Url::parse("ws://127.0.0.1:9/").expect("url"));
        assert!(matches!(
            manager.subscribe("   ").await,
            Err(WatchError::EmptyCrewRunId)
        ));
        assert_eq!(manager.connection_state(), None);
        assert!(manager.subscription().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_a_noop() {
        let mut manager =
            ConnectionManager::new(Url::parse("ws://127.0.0.1:9/").expect("url"));
        manager.unsubscribe().await;
        manager.unsubscribe().await;
        assert_eq!(manager.connection_state(), None);
        assert_eq!(manager.next_event().await, None);
    }

    #[test]
    fn binary_frames_are_read_as_utf8_text() {
        assert_eq!(
            message_text(Message::Binary(b"{\"kind\":\"log\"}".to_vec())),
            Some("{\"kind\":\"log\"}".to_string())
        );
        assert_eq!(message_text(Message::Binary(vec![0xff, 0xfe])), None);
        assert_eq!(message_text(Message::Pong(Vec::new())), None);
    }
}
