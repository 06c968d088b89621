use crate::wire::{ErrorNotice, LogEntry, Message, MessageBody, ProgressUpdate, StateSnapshot, StatusUpdate};
use crate::{AgentId, AgentStatus, ResultSummary, RunStatus, TaskId, TaskStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Default)]
pub struct TaskState {
    pub status: TaskStatus,
    pub progress: Option<f64>,
}

/// Aggregate view of one crew run, folded one [`Message`] at a time.
///
/// Map entries are only ever inserted or updated, `logs` is append-only, and `result`
/// is written at most once. Besides `log` messages, `logs` receives error notices and
/// the note a legacy frame carries.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct ExecutionState {
    current_agent_id: Option<AgentId>,
    current_task_id: Option<TaskId>,
    agent_states: BTreeMap<AgentId, AgentStatus>,
    task_states: BTreeMap<TaskId, TaskState>,
    agent_thoughts: BTreeMap<AgentId, String>,
    logs: Vec<String>,
    result: Option<ResultSummary>,
    messages_applied: u64,
    unknown_messages: u64,
}

/// Pure form of [`ExecutionState::apply`].
pub fn reduce(mut state: ExecutionState, message: &Message) -> ExecutionState {
    state.apply(message);
    state
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &Message) {
        let at = message.effective_timestamp();
        if let Some(note) = &message.note {
            self.apply_note(at, note, &message.body);
        }
        match &message.body {
            MessageBody::Status(update) => self.apply_status(update),
            MessageBody::Progress(update) => self.apply_progress(update),
            MessageBody::Log(entry) => self.apply_log(at, entry),
            MessageBody::Result(update) => {
                if let Some(summary) = &update.summary {
                    self.apply_result(summary);
                }
            }
            MessageBody::Error(notice) => self.apply_error(at, notice),
            MessageBody::Unknown { .. } => self.unknown_messages += 1,
        }
        self.messages_applied += 1;
    }

    fn apply_status(&mut self, update: &StatusUpdate) {
        if let Some(snapshot) = &update.snapshot {
            self.merge_snapshot(snapshot);
        }
        if let Some(agent_id) = &update.agent_id {
            self.point_at_agent(agent_id);
            if let Some(status) = update.agent_status {
                self.agent_states.insert(agent_id.clone(), status);
            }
            if let Some(thought) = &update.thought {
                self.agent_thoughts.insert(agent_id.clone(), thought.clone());
            }
        }
        if let Some(task_id) = &update.task_id {
            self.point_at_task(task_id);
            if let Some(status) = update.task_status {
                self.task_states.entry(task_id.clone()).or_default().status = status;
            }
        }
    }

    fn merge_snapshot(&mut self, snapshot: &StateSnapshot) {
        if let Some(agent_id) = &snapshot.current_agent_id {
            self.point_at_agent(agent_id);
        }
        if let Some(task_id) = &snapshot.current_task_id {
            self.point_at_task(task_id);
        }
        for (agent_id, status) in &snapshot.agent_states {
            self.agent_states.insert(agent_id.clone(), *status);
        }
        for (task_id, status) in &snapshot.task_states {
            self.task_states.entry(task_id.clone()).or_default().status = *status;
        }
        for (task_id, value) in &snapshot.task_progress {
            self.record_progress(task_id, *value);
        }
        for (agent_id, thought) in &snapshot.agent_thoughts {
            self.agent_thoughts.insert(agent_id.clone(), thought.clone());
        }
    }

    fn point_at_agent(&mut self, agent_id: &str) {
        if !self.is_terminal() {
            self.current_agent_id = Some(agent_id.to_string());
        }
    }

    fn point_at_task(&mut self, task_id: &str) {
        if !self.is_terminal() {
            self.current_task_id = Some(task_id.to_string());
        }
    }

    fn apply_progress(&mut self, update: &ProgressUpdate) {
        if let (Some(task_id), Some(value)) = (&update.task_id, update.value) {
            self.record_progress(task_id, value);
        }
    }

    fn record_progress(&mut self, task_id: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        let task = self.task_states.entry(task_id.to_string()).or_default();
        task.progress = Some(value);
        match task.status {
            TaskStatus::Failed | TaskStatus::Completed => {}
            _ if value >= 1.0 => task.status = TaskStatus::Completed,
            TaskStatus::Pending if value > 0.0 => task.status = TaskStatus::Running,
            _ => {}
        }
    }

    fn apply_log(&mut self, at: DateTime<Utc>, entry: &LogEntry) {
        let text = entry.text.as_deref().unwrap_or_default();
        self.logs.push(format!("{} - {text}", format_log_time(at)));
    }

    fn apply_note(&mut self, at: DateTime<Utc>, note: &str, body: &MessageBody) {
        let failed = matches!(
            body,
            MessageBody::Result(update)
                if update.summary.as_ref().map(|s| s.status) == Some(RunStatus::Error)
        );
        let line = if failed {
            format!("{} - error: {note}", format_log_time(at))
        } else {
            format!("{} - {note}", format_log_time(at))
        };
        self.logs.push(line);
    }

    fn apply_error(&mut self, at: DateTime<Utc>, notice: &ErrorNotice) {
        let text = notice.message.as_deref().unwrap_or("unspecified engine error");
        let line = match &notice.code {
            Some(code) => format!("{} - error [{code}]: {text}", format_log_time(at)),
            None => format!("{} - error: {text}", format_log_time(at)),
        };
        self.logs.push(line);
    }

    fn apply_result(&mut self, summary: &ResultSummary) {
        if self.result.is_some() || !summary.status.is_decisive() {
            return;
        }
        self.result = Some(summary.clone());
        self.current_agent_id = None;
        self.current_task_id = None;
    }

    pub fn current_agent_id(&self) -> Option<&str> {
        self.current_agent_id.as_deref()
    }

    pub fn current_task_id(&self) -> Option<&str> {
        self.current_task_id.as_deref()
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agent_states.get(agent_id).copied()
    }

    pub fn agent_states(&self) -> &BTreeMap<AgentId, AgentStatus> {
        &self.agent_states
    }

    pub fn task_state(&self, task_id: &str) -> Option<&TaskState> {
        self.task_states.get(task_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_states.get(task_id).map(|task| task.status)
    }

    pub fn task_states(&self) -> &BTreeMap<TaskId, TaskState> {
        &self.task_states
    }

    pub fn thought(&self, agent_id: &str) -> Option<&str> {
        self.agent_thoughts.get(agent_id).map(String::as_str)
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    /// Lines appended after `cursor` lines were already consumed.
    pub fn logs_since(&self, cursor: usize) -> &[String] {
        self.logs.get(cursor..).unwrap_or(&[])
    }

    pub fn result(&self) -> Option<&ResultSummary> {
        self.result.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.result.is_some()
    }

    pub fn has_activity(&self) -> bool {
        self.messages_applied > 0
    }

    pub fn messages_applied(&self) -> u64 {
        self.messages_applied
    }

    pub fn unknown_messages(&self) -> u64 {
        self.unknown_messages
    }
}

fn format_log_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
