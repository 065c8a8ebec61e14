use std::time::Duration;

use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit storage error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cannot build Merkle tree from empty input")]
    EmptyInput,

    #[error("Entry index {index} out of range for log of {len} entries")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Audit append exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("Audit append abandoned: log was busy past the caller's deadline")]
    DeadlineExpired,

    #[error("Audit append skipped: {0} appends already in flight")]
    Saturated(usize),

    #[error("Audit task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuditError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures of the underlying storage.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

pub type Result<T, E = AuditError> = std::result::Result<T, E>;
