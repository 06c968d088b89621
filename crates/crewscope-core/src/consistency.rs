use crate::execution::ExecutionState;
use crate::{AgentId, CrewDefinition, TaskId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// A run refers to an entity the crew definition does not know about.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyWarning {
    UnknownAgent { id: AgentId },
    UnknownTask { id: TaskId },
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyWarning::UnknownAgent { id } => write!(f, "unknown agent id: {id}"),
            ConsistencyWarning::UnknownTask { id } => write!(f, "unknown task id: {id}"),
        }
    }
}

pub fn consistency_warnings(def: &CrewDefinition, state: &ExecutionState) -> Vec<ConsistencyWarning> {
    let mut warnings = BTreeSet::new();
    let agent_ids = state
        .agent_states()
        .keys()
        .map(String::as_str)
        .chain(state.current_agent_id());
    for id in agent_ids {
        if def.agent(id).is_none() {
            warnings.insert(ConsistencyWarning::UnknownAgent { id: id.to_string() });
        }
    }
    let task_ids = state
        .task_states()
        .keys()
        .map(String::as_str)
        .chain(state.current_task_id());
    for id in task_ids {
        if def.task(id).is_none() {
            warnings.insert(ConsistencyWarning::UnknownTask { id: id.to_string() });
        }
    }
    warnings.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Normalizer;
    use chrono::Utc;

    #[test]
    fn reports_each_unknown_id_once() {
        let def: CrewDefinition = serde_json::from_str(
            r#"{"id":"c","name":"crew","agents":[{"id":"A1","name":"a"}],"tasks":[{"id":"T1","name":"t","agent_id":"A1"}]}"#,
        )
        .expect("crew");
        let mut normalizer = Normalizer::default();
        let mut state = ExecutionState::new();
        for raw in [
            r#"{"kind":"status","data":{"agent":"A1","state":"thinking"}}"#,
            r#"{"kind":"status","data":{"agent":"ghost","task":"T7","agent_state":"executing"}}"#,
            r#"{"kind":"progress","data":{"task":"T7","value":0.5}}"#,
        ] {
            state.apply(&normalizer.normalize(raw, Utc::now()).expect("decode"));
        }
        let warnings = consistency_warnings(&def, &state);
        assert_eq!(
            warnings,
            vec![
                ConsistencyWarning::UnknownAgent {
                    id: "ghost".to_string()
                },
                ConsistencyWarning::UnknownTask {
                    id: "T7".to_string()
                },
            ]
        );
        assert_eq!(warnings[1].to_string(), "unknown task id: T7");
    }
}
