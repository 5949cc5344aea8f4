//! Plugin host error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid record: {0}")]
    Protocol(String),

    #[error("record exceeds maximum length of {max} bytes")]
    RecordTooLong { max: usize },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("missing or invalid field '{field}' for action {action}")]
    InvalidField { action: String, field: &'static str },

    #[error("Plugin {0} not found")]
    NotFound(String),

    #[error("failed to load plugin {plugin}: {message}")]
    Load { plugin: String, message: String },

    #[error("failed to load plugin {0}: plugin must export an object")]
    InvalidExport(String),

    #[error("failed to load plugin {plugin}: initialization exceeded {secs}s")]
    LoadTimeout { plugin: String, secs: u64 },

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin {plugin} failed in {action}: {message}")]
    Thrown {
        plugin: String,
        action: String,
        message: String,
    },

    #[error("plugin {plugin} returned an invalid result for {action}: {message}")]
    InvalidResult {
        plugin: String,
        action: String,
        message: String,
    },

    #[error("plugin {plugin} was interrupted after exceeding its {secs}s execution budget")]
    Interrupted { plugin: String, secs: u64 },

    #[error("timer delay {requested}ms exceeds maximum of {max}ms")]
    TimerCeiling { requested: u64, max: u64 },

    #[error("fetch rejected: {0}")]
    FetchDenied(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("host proxy request {0} timed out")]
    ProxyTimeout(String),

    #[error("host proxy channel closed")]
    ProxyClosed,

    #[error("host is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
