pub mod config;
pub mod connection;
pub mod engine;
pub mod logging;
pub mod render;
pub mod session;

pub use config::{ConfigError, WatchConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, Subscription, WatchError};
pub use engine::{EngineClient, EngineError, StopOutcome};
pub use session::{RunSession, RunSnapshot, RunWatcher};
