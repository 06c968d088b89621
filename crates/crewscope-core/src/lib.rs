pub mod consistency;
pub mod execution;
pub mod graph;
pub mod wire;

pub use consistency::{consistency_warnings, ConsistencyWarning};
pub use execution::{reduce, ExecutionState, TaskState};
pub use graph::{build_graph, CrewStatus, GraphEdge, GraphModel, GraphNode, NodeKind, NodeStatus};
pub use wire::{DecodeError, Message, MessageBody, MessageKind, Normalizer};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type AgentId = String;
pub type TaskId = String;
pub type CrewRunId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    Executing,
    Delegating,
    Waiting,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Executing => "executing",
            AgentStatus::Delegating => "delegating",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "idle" => Ok(AgentStatus::Idle),
            "thinking" => Ok(AgentStatus::Thinking),
            "executing" => Ok(AgentStatus::Executing),
            "delegating" => Ok(AgentStatus::Delegating),
            "waiting" => Ok(AgentStatus::Waiting),
            "error" | "failed" => Ok(AgentStatus::Error),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" | "in-progress" | "in_progress" | "inprogress" => Ok(TaskStatus::Running),
            "completed" | "complete" | "done" => Ok(TaskStatus::Completed),
            "failed" | "error" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown task status: {other}")),
        }
    }
}

/// Engine-level status of a whole crew run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Initializing,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initializing => "initializing",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }

    /// Only `completed` and `error` settle a run's result.
    pub fn is_decisive(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "initializing" | "started" => Ok(RunStatus::Initializing),
            "running" => Ok(RunStatus::Running),
            "completed" | "complete" | "done" => Ok(RunStatus::Completed),
            "error" | "failed" => Ok(RunStatus::Error),
            other => Err(format!("Unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultSummary {
    pub status: RunStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<ResultOutput>,
}

impl ResultSummary {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            start_time: None,
            end_time: None,
            duration_seconds: None,
            error: None,
            output: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResultOutput {
    pub raw: String,
    /// Keyed by whatever the engine uses to identify a task in its output (often the
    /// task description rather than its id).
    #[serde(default)]
    pub per_task: BTreeMap<String, TaskOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskOutput {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "agentId", deserialize_with = "deserialize_id")]
    pub agent_id: AgentId,
}

/// Static configuration of a crew as supplied by the CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrewDefinition {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("{kind} has an empty id")]
    EmptyId { kind: &'static str },
    #[error("duplicate node id: {id}")]
    DuplicateId { id: String },
    #[error("task {task_id} is assigned to unknown agent {agent_id}")]
    UnknownAgent { task_id: TaskId, agent_id: AgentId },
}

impl CrewDefinition {
    pub fn agent(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Node ids share one namespace in the graph, so the crew, agents and tasks must all
    /// be distinct.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId { kind: "crew" });
        }
        let mut seen = HashSet::new();
        seen.insert(self.id.as_str());
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(DefinitionError::EmptyId { kind: "agent" });
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(DefinitionError::DuplicateId {
                    id: agent.id.clone(),
                });
            }
        }
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(DefinitionError::EmptyId { kind: "task" });
            }
            if !seen.insert(task.id.as_str()) {
                return Err(DefinitionError::DuplicateId {
                    id: task.id.clone(),
                });
            }
            if self.agent(&task.agent_id).is_none() {
                return Err(DefinitionError::UnknownAgent {
                    task_id: task.id.clone(),
                    agent_id: task.agent_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_agent_crew() -> CrewDefinition {
        serde_json::from_str(
            r#"{
                "id": "crew-1",
                "name": "Research crew",
                "agents": [
                    {"id": "A1", "name": "Researcher", "tools": ["search"]},
                    {"id": 2, "name": "Writer"}
                ],
                "tasks": [
                    {"id": "T1", "name": "Collect", "description": "collect sources", "agent_id": "A1"},
                    {"id": "T2", "name": "Draft", "agentId": 2}
                ]
            }"#,
        )
        .expect("parse crew")
    }

    #[test]
    fn crew_definition_accepts_numeric_ids_and_camel_case_agent_ref() {
        let crew = two_agent_crew();
        assert_eq!(crew.agents[1].id, "2");
        assert_eq!(crew.tasks[1].agent_id, "2");
        assert!(crew.agents[1].tools.is_empty());
        assert_eq!(crew.tasks[1].description, "");
        assert!(crew.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_ids_across_node_kinds() {
        let mut crew = two_agent_crew();
        crew.tasks[0].id = "A1".to_string();
        assert_eq!(
            crew.validate(),
            Err(DefinitionError::DuplicateId {
                id: "A1".to_string()
            })
        );
    }

    #[test]
    fn validate_rejects_tasks_with_unknown_agent() {
        let mut crew = two_agent_crew();
        crew.tasks[1].agent_id = "ghost".to_string();
        assert!(matches!(
            crew.validate(),
            Err(DefinitionError::UnknownAgent { ref agent_id, .. }) if agent_id == "ghost"
        ));
    }

    #[test]
    fn validate_rejects_blank_ids() {
        let mut crew = two_agent_crew();
        crew.agents[0].id = "  ".to_string();
        assert_eq!(
            crew.validate(),
            Err(DefinitionError::EmptyId { kind: "agent" })
        );
    }

    #[test]
    fn status_parsing_accepts_engine_aliases() {
        assert_eq!("Executing".parse::<AgentStatus>(), Ok(AgentStatus::Executing));
        assert_eq!("failed".parse::<AgentStatus>(), Ok(AgentStatus::Error));
        assert_eq!("in_progress".parse::<TaskStatus>(), Ok(TaskStatus::Running));
        assert_eq!("done".parse::<TaskStatus>(), Ok(TaskStatus::Completed));
        assert_eq!("started".parse::<RunStatus>(), Ok(RunStatus::Initializing));
        assert!("sleeping".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn only_completed_and_error_are_decisive() {
        assert!(RunStatus::Completed.is_decisive());
        assert!(RunStatus::Error.is_decisive());
        assert!(!RunStatus::Running.is_decisive());
        assert!(!RunStatus::Initializing.is_decisive());
    }
}
