use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_LOG_DIR: &str = ".crewscope/logs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine url {url}: {source}")]
    InvalidEngineUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported engine url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("engine url cannot carry a path: {0}")]
    NotABase(String),
    #[error("invalid input {0:?}, expected key=value")]
    InvalidInput(String),
}

/// Settings shared by every subcommand once flags and environment are merged.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub engine_url: Url,
    pub ws_base: Url,
    pub log_dir: PathBuf,
    pub log_stderr: bool,
    pub max_frame_bytes: usize,
}

impl WatchConfig {
    pub fn resolve(
        engine_url_flag: &str,
        log_dir_flag: &str,
        max_frame_bytes: usize,
    ) -> Result<Self, ConfigError> {
        let engine_url = resolve_engine_url(engine_url_flag)?;
        let ws_base = derive_ws_base(&engine_url)?;
        Ok(Self {
            engine_url,
            ws_base,
            log_dir: resolve_log_dir(log_dir_flag),
            log_stderr: resolve_log_stderr(),
            max_frame_bytes,
        })
    }
}

pub fn resolve_engine_url(flag: &str) -> Result<Url, ConfigError> {
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else if let Some(value) = env_value("CREWSCOPE_ENGINE_URL") {
        value
    } else {
        DEFAULT_ENGINE_URL.to_string()
    };
    Url::parse(&raw).map_err(|source| ConfigError::InvalidEngineUrl { url: raw, source })
}

pub fn resolve_log_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    env_value("CREWSCOPE_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

pub fn resolve_log_stderr() -> bool {
    env_value("CREWSCOPE_LOG_STDERR")
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `http` becomes `ws` and `https` becomes `wss`; a `ws(s)` url is taken as is.
pub fn derive_ws_base(engine_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match engine_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    if engine_url.cannot_be_a_base() {
        return Err(ConfigError::NotABase(engine_url.to_string()));
    }
    let mut ws = engine_url.clone();
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(engine_url.scheme().to_string()))?;
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

/// `<ws_base>/api/v1/crews/<crew_run_id>/ws`, with the id escaped as a single segment.
pub fn crew_ws_url(ws_base: &Url, crew_run_id: &str) -> Result<Url, ConfigError> {
    let mut url = ws_base.clone();
    url.path_segments_mut()
        .map_err(|_| ConfigError::NotABase(ws_base.to_string()))?
        .pop_if_empty()
        .extend(["api", "v1", "crews", crew_run_id, "ws"]);
    Ok(url)
}

/// Parses repeated `--input key=value` flags. Later keys overwrite earlier ones.
pub fn parse_inputs(raw: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut inputs = BTreeMap::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(ConfigError::InvalidInput(entry.clone()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidInput(entry.clone()));
        }
        inputs.insert(key.to_string(), value.to_string());
    }
    Ok(inputs)
}
