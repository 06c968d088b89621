use crate::session::RunSnapshot;
use crewscope_core::{GraphModel, GraphNode, NodeKind, ResultSummary};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Text tree of the graph: crew, then each agent with its tasks. Active nodes end in `*`
/// and the active agent's latest thought follows it on a `>` line.
pub fn render_graph(graph: &GraphModel) -> String {
    let mut out = String::new();
    let mut placed = BTreeSet::new();
    for crew in graph.nodes.iter().filter(|node| node.kind == NodeKind::Crew) {
        push_node(&mut out, 0, crew);
        placed.insert(crew.id.as_str());
        for agent in graph.children(&crew.id) {
            push_node(&mut out, 1, agent);
            if let (true, Some(thought)) = (agent.is_active, agent.thought.as_deref()) {
                let _ = writeln!(out, "      > {}", thought.trim());
            }
            placed.insert(agent.id.as_str());
            for task in graph.children(&agent.id) {
                push_node(&mut out, 2, task);
                placed.insert(task.id.as_str());
            }
        }
    }
    let unplaced: Vec<_> = graph
        .nodes
        .iter()
        .filter(|node| !placed.contains(node.id.as_str()))
        .collect();
    if !unplaced.is_empty() {
        out.push_str("  (unassigned)\n");
        for node in unplaced {
            push_node(&mut out, 2, node);
        }
    }
    out
}

fn push_node(out: &mut String, depth: usize, node: &GraphNode) {
    let marker = if node.is_active { " *" } else { "" };
    let _ = writeln!(
        out,
        "{}[{}] {}{marker}",
        "  ".repeat(depth),
        node.status,
        node.label
    );
}

pub fn render_result(result: &ResultSummary) -> String {
    let mut out = format!("result: {}", result.status);
    if let Some(duration) = result.duration_seconds {
        let _ = write!(out, " in {duration:.1}s");
    }
    out.push('\n');
    if let Some(error) = &result.error {
        let _ = writeln!(out, "error: {error}");
    }
    if let Some(output) = &result.output {
        if !output.raw.trim().is_empty() {
            let _ = writeln!(out, "{}", output.raw.trim_end());
        }
        for (key, task) in &output.per_task {
            let text = task
                .summary
                .as_deref()
                .or(task.raw.as_deref())
                .unwrap_or("-");
            let _ = writeln!(out, "  {key}: {text}");
        }
    }
    out
}

pub fn render_connection(snapshot: &RunSnapshot) -> String {
    let state = snapshot
        .connection
        .map(|state| state.as_str())
        .unwrap_or("idle");
    format!("connection: {state} ({})", snapshot.crew_run_id)
}

pub fn render_json<T: serde::Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

/// Incremental text output for a stream of snapshots. Each call returns only what
/// changed since the previous one.
#[derive(Debug, Default)]
pub struct TextRenderer {
    generation: u64,
    log_cursor: usize,
    last_graph: Option<String>,
    last_connection: Option<String>,
    result_shown: bool,
}

impl TextRenderer {
    pub fn render(&mut self, snapshot: &RunSnapshot) -> String {
        if snapshot.generation != self.generation {
            *self = TextRenderer {
                generation: snapshot.generation,
                ..TextRenderer::default()
            };
        }
        let mut out = String::new();
        let connection = render_connection(snapshot);
        if self.last_connection.as_deref() != Some(connection.as_str()) {
            let _ = writeln!(out, "{connection}");
            self.last_connection = Some(connection);
        }
        for line in snapshot.state.logs_since(self.log_cursor) {
            let _ = writeln!(out, "{line}");
        }
        self.log_cursor = snapshot.state.logs().len();
        if let Some(graph) = &snapshot.graph {
            let text = render_graph(graph);
            if self.last_graph.as_deref() != Some(text.as_str()) {
                out.push_str(&text);
                self.last_graph = Some(text);
            }
        }
        if let (false, Some(result)) = (self.result_shown, snapshot.state.result()) {
            out.push_str(&render_result(result));
            self.result_shown = true;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewscope_core::{
        build_graph, reduce, CrewDefinition, ExecutionState, Normalizer, ResultOutput,
        RunStatus, TaskOutput,
    };
    use std::collections::BTreeMap;

    fn crew() -> CrewDefinition {
        serde_json::from_str(
            r#"{"id":"c","name":"Research crew","agents":[{"id":"A1","name":"Researcher"},{"id":"A2","name":"Writer"}],"tasks":[{"id":"T1","name":"Collect","agent_id":"A1"},{"id":"T2","name":"Draft","agent_id":"A2"},{"id":"T3","name":"Stray","agent_id":"nobody"}]}"#,
        )
        .expect("crew")
    }

    fn state(frames: &[&str]) -> ExecutionState {
        let mut normalizer = Normalizer::default();
        frames.iter().fold(ExecutionState::new(), |state, raw| {
            let message = normalizer
                .normalize(raw, chrono::Utc::now())
                .expect("decode");
            reduce(state, &message)
        })
    }

    #[test]
    fn graph_renders_as_indented_tree() {
        let state = state(&[r#"{"kind":"status","data":{"agent":"A1","task":"T1","agent_state":"executing","task_state":"running"}}"#]);
        let text = render_graph(&build_graph(&crew(), &state));
        assert_eq!(
            text,
            "[running] Research crew\n  [executing] Researcher *\n    [running] Collect *\n  [idle] Writer\n    [pending] Draft\n  (unassigned)\n    [pending] Stray\n"
        );
    }

    #[test]
    fn active_agent_shows_latest_thought() {
        let state = state(&[
            r#"{"kind":"status","data":{"agent":"A2","thought":"tone check"}}"#,
            r#"{"kind":"status","data":{"agent":"A1","task":"T1","agent_state":"thinking","thought":"which sources first?"}}"#,
        ]);
        let text = render_graph(&build_graph(&crew(), &state));
        assert!(text.contains("  [thinking] Researcher *\n      > which sources first?\n    [pending] Collect *\n"));
        assert!(!text.contains("tone check"));
    }

    #[test]
    fn result_lists_per_task_output() {
        let mut result = ResultSummary::new(RunStatus::Completed);
        result.duration_seconds = Some(2.5);
        result.output = Some(ResultOutput {
            raw: "final report\n".to_string(),
            per_task: BTreeMap::from([(
                "collect sources".to_string(),
                TaskOutput {
                    raw: Some("links".to_string()),
                    ..TaskOutput::default()
                },
            )]),
        });
        assert_eq!(
            render_result(&result),
            "result: completed in 2.5s\nfinal report\n  collect sources: links\n"
        );
    }

    #[test]
    fn text_renderer_emits_only_new_lines() {
        let mut renderer = TextRenderer::default();
        let mut snapshot = RunSnapshot {
            crew_run_id: "c".to_string(),
            generation: 1,
            state: state(&[r#"{"kind":"log","data":{"message":"one"}}"#]),
            ..RunSnapshot::default()
        };
        let first = renderer.render(&snapshot);
        assert!(first.starts_with("connection: idle (c)\n"));
        assert!(first.ends_with(" - one\n"));

        snapshot.state = state(&[
            r#"{"kind":"log","data":{"message":"one"}}"#,
            r#"{"kind":"log","data":{"message":"two"}}"#,
        ]);
        let second = renderer.render(&snapshot);
        assert_eq!(second.lines().count(), 1);
        assert!(second.ends_with(" - two\n"));

        snapshot.generation = 2;
        let fresh = renderer.render(&snapshot);
        assert!(fresh.contains(" - one\n"));
    }
}
