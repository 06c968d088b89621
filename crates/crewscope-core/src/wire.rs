//! Decoding of real-time frames into typed [`Message`] values.
//!
//! The execution engine owns the wire schema, so every field is read defensively: a
//! missing or garbled field becomes `None` and only structural problems (not JSON, not
//! an object, no discriminant) are reported as a [`DecodeError`].

use crate::{AgentId, AgentStatus, ResultOutput, ResultSummary, RunStatus, TaskId, TaskOutput, TaskStatus};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Json(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no kind discriminant")]
    MissingKind,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Status,
    Progress,
    Log,
    Result,
    Error,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Status => "status",
            MessageKind::Progress => "progress",
            MessageKind::Log => "log",
            MessageKind::Result => "result",
            MessageKind::Error => "error",
            MessageKind::Unknown => "unknown",
        }
    }

    fn from_discriminant(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "status" => MessageKind::Status,
            "progress" => MessageKind::Progress,
            "log" => MessageKind::Log,
            "result" => MessageKind::Result,
            "error" => MessageKind::Error,
            _ => MessageKind::Unknown,
        }
    }

    /// `{type, payload}` frames. A failing payload always ends the run, whatever its type.
    fn from_legacy(raw: &str, failed: bool) -> Self {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            _ if failed => MessageKind::Result,
            "start_crew" | "execution_update" => MessageKind::Status,
            "execution_complete" | "execution_error" => MessageKind::Result,
            other => MessageKind::from_discriminant(other),
        }
    }
}

/// One decoded frame. `index` is assigned by the [`Normalizer`] in arrival order.
///
/// `note` is the human-readable line a legacy frame carries next to its body
/// (`payload.message`); the reducer appends it to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub index: u64,
    pub received_at: DateTime<Utc>,
    pub timestamp: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub body: MessageBody,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Status(_) => MessageKind::Status,
            MessageBody::Progress(_) => MessageKind::Progress,
            MessageBody::Log(_) => MessageKind::Log,
            MessageBody::Result(_) => MessageKind::Result,
            MessageBody::Error(_) => MessageKind::Error,
            MessageBody::Unknown { .. } => MessageKind::Unknown,
        }
    }

    /// Engine timestamp when present, arrival time otherwise.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(self.received_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Status(StatusUpdate),
    Progress(ProgressUpdate),
    Log(LogEntry),
    Result(ResultUpdate),
    Error(ErrorNotice),
    Unknown { kind: String, payload: Value },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatusUpdate {
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
    pub agent_status: Option<AgentStatus>,
    pub task_status: Option<TaskStatus>,
    pub thought: Option<String>,
    pub snapshot: Option<StateSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressUpdate {
    pub task_id: Option<TaskId>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogEntry {
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultUpdate {
    pub summary: Option<ResultSummary>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorNotice {
    pub message: Option<String>,
    pub code: Option<String>,
}

/// Whole-state view some engines embed in status frames (`data.execution_state`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateSnapshot {
    pub current_agent_id: Option<AgentId>,
    pub current_task_id: Option<TaskId>,
    pub agent_states: BTreeMap<AgentId, AgentStatus>,
    pub task_states: BTreeMap<TaskId, TaskStatus>,
    pub task_progress: BTreeMap<TaskId, f64>,
    pub agent_thoughts: BTreeMap<AgentId, String>,
}

/// Stateful decoder for one subscription. Assigns a non-decreasing arrival index to every
/// frame that decodes; rejected frames do not consume an index.
#[derive(Debug, Clone)]
pub struct Normalizer {
    max_frame_bytes: usize,
    next_index: u64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Normalizer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            next_index: 0,
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.next_index
    }

    pub fn normalize(
        &mut self,
        raw: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Message, DecodeError> {
        let envelope = decode_envelope(raw, self.max_frame_bytes)?;
        let body = build_body(&envelope);
        let message = Message {
            index: self.next_index,
            received_at,
            timestamp: envelope.timestamp,
            note: envelope.note,
            body,
        };
        self.next_index += 1;
        Ok(message)
    }
}

struct Envelope {
    discriminant: String,
    kind: MessageKind,
    data: Map<String, Value>,
    timestamp: Option<DateTime<Utc>>,
    note: Option<String>,
    original: Value,
}

fn decode_envelope(raw: &str, max_frame_bytes: usize) -> Result<Envelope, DecodeError> {
    let trimmed = raw.trim_end_matches(['\n', '\r']);
    if trimmed.len() > max_frame_bytes {
        return Err(DecodeError::Oversized {
            size: trimmed.len(),
            max: max_frame_bytes,
        });
    }
    let original: Value =
        serde_json::from_str(trimmed).map_err(|err| DecodeError::Json(err.to_string()))?;
    let root = original.as_object().ok_or(DecodeError::NotAnObject)?;

    if let Some(discriminant) = root.get("kind").and_then(Value::as_str) {
        let data = root
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let timestamp =
            timestamp_field(root, &["timestamp"]).or_else(|| timestamp_field(&data, &["timestamp"]));
        return Ok(Envelope {
            discriminant: discriminant.to_string(),
            kind: MessageKind::from_discriminant(discriminant),
            data,
            timestamp,
            note: None,
            original: original.clone(),
        });
    }

    // {"type": ..., "payload": {"status", "message", "data", "timestamp"}}
    if let Some(discriminant) = root.get("type").and_then(Value::as_str) {
        let empty = Map::new();
        let payload = root
            .get("payload")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let mut data = payload
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for key in ["message", "status"] {
            if !data.contains_key(key) {
                if let Some(value) = payload.get(key) {
                    data.insert(key.to_string(), value.clone());
                }
            }
        }
        let note = string_field(payload, &["message"]);
        let failed = discriminant.trim().eq_ignore_ascii_case("execution_error")
            || string_field(payload, &["status"])
                .map(|status| status.trim().eq_ignore_ascii_case("error"))
                .unwrap_or(false);
        if failed {
            data.insert("status".to_string(), Value::from("error"));
            if string_field(&data, &["error"]).is_none() {
                if let Some(message) = &note {
                    data.insert("error".to_string(), Value::from(message.as_str()));
                }
            }
        }
        let timestamp = timestamp_field(payload, &["timestamp"])
            .or_else(|| timestamp_field(root, &["timestamp"]));
        return Ok(Envelope {
            discriminant: discriminant.to_string(),
            kind: MessageKind::from_legacy(discriminant, failed),
            data,
            timestamp,
            note,
            original: original.clone(),
        });
    }

    Err(DecodeError::MissingKind)
}

fn build_body(envelope: &Envelope) -> MessageBody {
    let data = &envelope.data;
    match envelope.kind {
        MessageKind::Status => MessageBody::Status(parse_status(data)),
        MessageKind::Progress => MessageBody::Progress(ProgressUpdate {
            task_id: string_field(data, &["task", "task_id", "taskId"]),
            value: number_field(data, &["value", "progress"]),
        }),
        MessageKind::Log => MessageBody::Log(LogEntry {
            text: string_field(data, &["message", "line", "text"]),
        }),
        MessageKind::Result => {
            let summary = match object_field(data, &["result"]) {
                Some(result) => parse_result_summary(result),
                None => parse_result_summary(data),
            };
            MessageBody::Result(ResultUpdate { summary })
        }
        MessageKind::Error => MessageBody::Error(ErrorNotice {
            message: string_field(data, &["message", "error"]),
            code: string_field(data, &["code"]),
        }),
        MessageKind::Unknown => MessageBody::Unknown {
            kind: envelope.discriminant.clone(),
            payload: envelope.original.clone(),
        },
    }
}

fn parse_status(data: &Map<String, Value>) -> StatusUpdate {
    let agent_id = string_field(data, &["agent", "agent_id", "agentId"]);
    let task_id = string_field(data, &["task", "task_id", "taskId"]);
    let state = string_field(data, &["state"]);

    // A bare `state` describes the agent when one is named and the word is an agent
    // status; otherwise it falls through to the named task.
    let bare_agent = agent_id
        .as_ref()
        .and(state.as_deref())
        .and_then(|raw| raw.parse::<AgentStatus>().ok());
    let agent_status =
        parsed_field::<AgentStatus>(data, &["agent_state", "agentState"]).or(bare_agent);
    let task_status = parsed_field::<TaskStatus>(data, &["task_state", "taskState"]).or_else(|| {
        if bare_agent.is_some() || task_id.is_none() {
            return None;
        }
        state.as_deref().and_then(|raw| raw.parse().ok())
    });

    StatusUpdate {
        agent_id,
        task_id,
        agent_status,
        task_status,
        thought: string_field(data, &["thought"]),
        snapshot: object_field(data, &["execution_state", "executionState"]).map(parse_snapshot),
    }
}

fn parse_snapshot(raw: &Map<String, Value>) -> StateSnapshot {
    StateSnapshot {
        current_agent_id: string_field(raw, &["current_agent_id", "current_agent", "currentAgentId"]),
        current_task_id: string_field(raw, &["current_task_id", "current_task", "currentTaskId"]),
        agent_states: parsed_map(raw, &["agent_states", "agentStates"]),
        task_states: parsed_map(raw, &["task_states", "taskStates"]),
        task_progress: object_field(raw, &["task_progress", "taskProgress"])
            .map(|map| {
                map.iter()
                    .filter_map(|(key, value)| finite_number(value).map(|v| (key.clone(), v)))
                    .collect()
            })
            .unwrap_or_default(),
        agent_thoughts: object_field(raw, &["agent_thoughts", "agentThoughts"])
            .map(|map| {
                map.iter()
                    .filter_map(|(key, value)| {
                        value.as_str().map(|text| (key.clone(), text.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Returns `None` unless the payload names a recognisable run status.
pub fn parse_result_summary(raw: &Map<String, Value>) -> Option<ResultSummary> {
    let status = parsed_field::<RunStatus>(raw, &["status"])?;
    Some(ResultSummary {
        status,
        start_time: timestamp_field(raw, &["start_time", "startTime"]),
        end_time: timestamp_field(raw, &["end_time", "endTime"]),
        duration_seconds: number_field(
            raw,
            &["duration_seconds", "durationSeconds", "execution_time"],
        ),
        error: string_field(raw, &["error"]),
        output: raw.get("output").and_then(parse_output),
    })
}

fn parse_output(value: &Value) -> Option<ResultOutput> {
    match value {
        Value::String(raw) => Some(ResultOutput {
            raw: raw.clone(),
            per_task: BTreeMap::new(),
        }),
        Value::Object(map) => {
            let per_task = object_field(map, &["tasks", "per_task", "perTask"])
                .map(|tasks| {
                    tasks
                        .iter()
                        .filter_map(|(key, value)| {
                            value.as_object().map(|task| (key.clone(), parse_task_output(task)))
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(ResultOutput {
                raw: string_field(map, &["raw"]).unwrap_or_default(),
                per_task,
            })
        }
        _ => None,
    }
}

fn parse_task_output(raw: &Map<String, Value>) -> TaskOutput {
    // `output` is either the raw text or a nested object carrying `raw` and `summary`.
    let (nested_raw, nested_summary) = match raw.get("output") {
        Some(Value::String(text)) => (Some(text.clone()), None),
        Some(Value::Object(nested)) => (
            string_field(nested, &["raw"]),
            string_field(nested, &["summary"]),
        ),
        _ => (None, None),
    };
    TaskOutput {
        description: string_field(raw, &["description"]),
        agent: string_field(raw, &["agent"]),
        raw: string_field(raw, &["raw"]).or(nested_raw),
        summary: string_field(raw, &["summary"]).or(nested_summary),
        status: string_field(raw, &["status"]),
    }
}

/// Accepts RFC 3339 and the zone-less ISO form (`2024-05-01T10:00:00.123456`), read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn number_field(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| finite_number(map.get(*key)?))
}

fn finite_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn object_field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter().find_map(|key| map.get(*key)?.as_object())
}

fn timestamp_field(map: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|key| map.get(*key)?.as_str().and_then(parse_timestamp))
}

fn parsed_field<T: std::str::FromStr>(map: &Map<String, Value>, keys: &[&str]) -> Option<T> {
    keys.iter()
        .find_map(|key| map.get(*key)?.as_str().and_then(|raw| raw.parse().ok()))
}

fn parsed_map<T: std::str::FromStr>(map: &Map<String, Value>, keys: &[&str]) -> BTreeMap<String, T> {
    object_field(map, keys)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(key, value)| {
                    value
                        .as_str()
                        .and_then(|raw| raw.parse().ok())
                        .map(|parsed| (key.clone(), parsed))
                })
                .collect()
        })
        .unwrap_or_default()
}
