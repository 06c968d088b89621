use crate::execution::ExecutionState;
use crate::{AgentStatus, CrewDefinition, RunStatus, TaskStatus};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Crew,
    Agent,
    Task,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Crew => "crew",
            NodeKind::Agent => "agent",
            NodeKind::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CrewStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl CrewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrewStatus::Pending => "pending",
            CrewStatus::Running => "running",
            CrewStatus::Completed => "completed",
            CrewStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum NodeStatus {
    Crew(CrewStatus),
    Agent(AgentStatus),
    Task(TaskStatus),
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Crew(status) => status.as_str(),
            NodeStatus::Agent(status) => status.as_str(),
            NodeStatus::Task(status) => status.as_str(),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    pub status: NodeStatus,
    pub is_active: bool,
    /// Latest thought, agents only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl GraphEdge {
    fn between(source: &str, target: &str) -> Self {
        Self {
            id: format!("{source}-{target}"),
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct GraphModel {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphModel {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(|node| node.is_active)
    }

    pub fn children<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphNode> + 'a {
        self.edges
            .iter()
            .filter(move |edge| edge.source == id)
            .filter_map(move |edge| self.node(&edge.target))
    }
}

/// Projects the crew skeleton and the current run state into a fresh graph.
///
/// The shape depends only on `def`; `state` contributes statuses and the active
/// markers. Ids in `state` that the definition does not know never become nodes.
pub fn build_graph(def: &CrewDefinition, state: &ExecutionState) -> GraphModel {
    let mut nodes = Vec::with_capacity(1 + def.agents.len() + def.tasks.len());
    let mut edges = Vec::with_capacity(def.agents.len() + def.tasks.len());

    nodes.push(GraphNode {
        id: def.id.clone(),
        kind: NodeKind::Crew,
        label: def.name.clone(),
        status: NodeStatus::Crew(crew_status(state)),
        is_active: false,
        thought: None,
    });

    for agent in &def.agents {
        nodes.push(GraphNode {
            id: agent.id.clone(),
            kind: NodeKind::Agent,
            label: agent.name.clone(),
            status: NodeStatus::Agent(state.agent_status(&agent.id).unwrap_or_default()),
            is_active: state.current_agent_id() == Some(agent.id.as_str()),
            thought: state.thought(&agent.id).map(str::to_string),
        });
        edges.push(GraphEdge::between(&def.id, &agent.id));
    }

    for task in &def.tasks {
        nodes.push(GraphNode {
            id: task.id.clone(),
            kind: NodeKind::Task,
            label: task.name.clone(),
            status: NodeStatus::Task(state.task_status(&task.id).unwrap_or_default()),
            is_active: state.current_task_id() == Some(task.id.as_str()),
            thought: None,
        });
        if def.agent(&task.agent_id).is_some() {
            edges.push(GraphEdge::between(&task.agent_id, &task.id));
        }
    }

    GraphModel { nodes, edges }
}

fn crew_status(state: &ExecutionState) -> CrewStatus {
    match state.result().map(|result| result.status) {
        Some(RunStatus::Completed) => CrewStatus::Completed,
        Some(RunStatus::Error) => CrewStatus::Error,
        _ if state.has_activity() => CrewStatus::Running,
        _ => CrewStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Normalizer;
    use crate::{AgentDescriptor, TaskDescriptor};
    use chrono::Utc;

    fn crew() -> CrewDefinition {
        CrewDefinition {
            id: "crew".to_string(),
            name: "Launch crew".to_string(),
            agents: vec![AgentDescriptor {
                id: "A1".to_string(),
                name: "Planner".to_string(),
                tools: vec![],
            }],
            tasks: vec![
                TaskDescriptor {
                    id: "T1".to_string(),
                    name: "Plan".to_string(),
                    description: String::new(),
                    agent_id: "A1".to_string(),
                },
                TaskDescriptor {
                    id: "T9".to_string(),
                    name: "Orphan".to_string(),
                    description: String::new(),
                    agent_id: "nobody".to_string(),
                },
            ],
        }
    }

    fn state_from(frames: &[&str]) -> ExecutionState {
        let mut normalizer = Normalizer::default();
        let mut state = ExecutionState::new();
        for raw in frames {
            let message = normalizer.normalize(raw, Utc::now()).expect("decode");
            state.apply(&message);
        }
        state
    }

    #[test]
    fn skeleton_defaults_before_any_message() {
        let graph = build_graph(&crew(), &ExecutionState::new());
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(
            graph.node("crew").map(|n| n.status),
            Some(NodeStatus::Crew(CrewStatus::Pending))
        );
        assert_eq!(
            graph.node("A1").map(|n| n.status),
            Some(NodeStatus::Agent(AgentStatus::Idle))
        );
        assert_eq!(
            graph.node("T1").map(|n| n.status),
            Some(NodeStatus::Task(TaskStatus::Pending))
        );
        assert_eq!(graph.active_nodes().count(), 0);
    }

    #[test]
    fn dangling_task_gets_node_but_no_edge() {
        let graph = build_graph(&crew(), &ExecutionState::new());
        assert!(graph.node("T9").is_some());
        let ids: Vec<_> = graph.edges.iter().map(|edge| edge.id.as_str()).collect();
        assert_eq!(ids, vec!["crew-A1", "A1-T1"]);
        let children: Vec<_> = graph.children("A1").map(|n| n.id.as_str()).collect();
        assert_eq!(children, vec!["T1"]);
    }

    #[test]
    fn active_markers_follow_pointers_and_ignore_unknown_ids() {
        let state = state_from(&[
            r#"{"kind":"status","data":{"agent":"A1","task":"T1","state":"executing"}}"#,
            r#"{"kind":"status","data":{"agent":"ghost","state":"thinking"}}"#,
        ]);
        let graph = build_graph(&crew(), &state);
        assert_eq!(graph.nodes.len(), 4);
        assert!(graph.node("ghost").is_none());
        let active: Vec<_> = graph.active_nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(active, vec!["T1"]);
        assert_eq!(
            graph.node("crew").map(|n| n.status),
            Some(NodeStatus::Crew(CrewStatus::Running))
        );
    }

    #[test]
    fn agent_nodes_carry_latest_thought() {
        let state = state_from(&[
            r#"{"kind":"status","data":{"agent":"A1","thought":"outline first"}}"#,
            r#"{"kind":"status","data":{"agent":"A1","thought":"check sources"}}"#,
        ]);
        let graph = build_graph(&crew(), &state);
        assert_eq!(
            graph.node("A1").and_then(|n| n.thought.as_deref()),
            Some("check sources")
        );
        assert_eq!(graph.node("T1").and_then(|n| n.thought.as_deref()), None);
        let json = serde_json::to_value(&graph.nodes[0]).expect("serialize");
        assert!(json.get("thought").is_none());
    }

    #[test]
    fn crew_status_reflects_terminal_error() {
        let state = state_from(&[r#"{"kind":"result","data":{"result":{"status":"error","error":"boom"}}}"#]);
        let graph = build_graph(&crew(), &state);
        assert_eq!(graph.nodes[0].status.as_str(), "error");
    }

    #[test]
    fn node_status_serializes_as_plain_string() {
        let graph = build_graph(&crew(), &ExecutionState::new());
        let json = serde_json::to_value(&graph.nodes[1]).expect("serialize");
        assert_eq!(json["status"], "idle");
        assert_eq!(json["kind"], "agent");
        assert_eq!(json["is_active"], false);
    }
}
