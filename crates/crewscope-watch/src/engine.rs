//! HTTP client for the external execution engine and its CRUD endpoints.

use crewscope_core::{CrewDefinition, DefinitionError, TaskDescriptor};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not reachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("engine returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("failed to parse engine response from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("missing required inputs: {}", .0.join(", "))]
    MissingInputs(Vec<String>),
    #[error("invalid crew definition: {0}")]
    Definition(#[from] DefinitionError),
}

/// Engines are not required to support stopping a run; a refusal is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Accepted,
    Rejected { status: u16 },
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    inputs: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct EngineTask {
    #[serde(flatten)]
    descriptor: TaskDescriptor,
    #[serde(default)]
    crew_id: Option<String>,
}

#[derive(Clone)]
pub struct EngineClient {
    base_url: String,
    client: Client,
}

impl EngineClient {
    pub fn new(engine_url: &Url) -> Self {
        Self {
            base_url: engine_url.as_str().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn crew_url(&self, crew_id: &str, suffix: &str) -> String {
        format!("{}/api/v1/crews/{crew_id}{suffix}", self.base_url)
    }

    /// Names the crew's prompts reference and that `start_run` must be given.
    pub async fn required_variables(&self, crew_id: &str) -> Result<BTreeSet<String>, EngineError> {
        let url = self.crew_url(crew_id, "/variables");
        let resp = self.send(self.client.get(&url), &url).await?;
        parse_json(resp, &url).await
    }

    /// Asks the engine to start a run. Acceptance only; progress arrives over the
    /// real-time channel.
    pub async fn start_run(
        &self,
        crew_id: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<Value, EngineError> {
        let required = self.required_variables(crew_id).await?;
        let missing = missing_inputs(&required, inputs);
        if !missing.is_empty() {
            return Err(EngineError::MissingInputs(missing));
        }
        let url = self.crew_url(crew_id, "/execute");
        info!(crew_id, inputs = inputs.len(), "engine_start_run");
        let resp = self
            .send(self.client.post(&url).json(&ExecuteRequest { inputs }), &url)
            .await?;
        parse_json(resp, &url).await
    }

    pub async fn stop_run(&self, crew_id: &str) -> Result<StopOutcome, EngineError> {
        let url = self.crew_url(crew_id, "/stop");
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|source| EngineError::Unreachable {
                url: url.clone(),
                source,
            })?;
        let status = resp.status();
        if status.is_success() {
            info!(crew_id, "engine_stop_accepted");
            return Ok(StopOutcome::Accepted);
        }
        warn!(crew_id, status = status.as_u16(), "engine_stop_rejected");
        Ok(StopOutcome::Rejected {
            status: status.as_u16(),
        })
    }

    /// Crew agents come from the crew resource; tasks are listed separately and kept when
    /// they belong to the crew or to one of its agents.
    pub async fn fetch_definition(&self, crew_id: &str) -> Result<CrewDefinition, EngineError> {
        let url = self.crew_url(crew_id, "");
        let resp = self.send(self.client.get(&url), &url).await?;
        let mut definition: CrewDefinition = parse_json(resp, &url).await?;

        let tasks_url = format!("{}/api/v1/tasks", self.base_url);
        let resp = self.send(self.client.get(&tasks_url), &tasks_url).await?;
        let tasks: Vec<EngineTask> = parse_json(resp, &tasks_url).await?;
        definition.tasks = tasks
            .into_iter()
            .filter(|task| {
                task.crew_id.as_deref() == Some(definition.id.as_str())
                    || definition.agent(&task.descriptor.agent_id).is_some()
            })
            .map(|task| task.descriptor)
            .collect();
        definition.validate()?;
        Ok(definition)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, EngineError> {
        let resp = request
            .send()
            .await
            .map_err(|source| EngineError::Unreachable {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(EngineError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body: error_detail(status, &body),
        })
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    url: &str,
) -> Result<T, EngineError> {
    resp.json().await.map_err(|source| EngineError::Parse {
        url: url.to_string(),
        source,
    })
}

/// FastAPI style `{"detail": ...}` bodies are reduced to their detail text.
fn error_detail(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| match value.get("detail") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        });
    match detail {
        Some(detail) => detail,
        None if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        None => body.trim().to_string(),
    }
}

fn missing_inputs(required: &BTreeSet<String>, inputs: &BTreeMap<String, String>) -> Vec<String> {
    required
        .iter()
        .filter(|name| {
            inputs
                .get(name.as_str())
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}
