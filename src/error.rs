//! Module-level error taxonomy.
//!
//! Each enum names a *kind* of failure a caller might want to match on;
//! task-boundary code (main, the four session sub-tasks, each post-call
//! pipeline stage) collapses these into `anyhow::Result` via `?` and logs
//! through `tracing` rather than propagating a panic.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no `start` frame received within {0:?}")]
    StartTimeout(std::time::Duration),
    #[error("telephony socket closed before start")]
    SocketClosedBeforeStart,
    #[error("LLM channel failed to open after retries: {0}")]
    LlmConnectFailed(String),
    #[error("telephony socket send error: {0}")]
    TelephonySend(String),
}

#[derive(Debug, Error)]
pub enum AudioPipelineError {
    #[error("invalid sample rate: {0} Hz")]
    InvalidRate(i64),
    #[error("base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("persistence insert failed: {0}")]
    PersistFailed(String),
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("generative model request failed: {0}")]
    RequestFailed(String),
    #[error("response missing required keys")]
    MissingKeys,
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("provider request failed after retries: {0}")]
    RequestFailed(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("no rows affected for key {0}")]
    NoRowsAffected(String),
    #[error("response decode failed: {0}")]
    Decode(String),
}
