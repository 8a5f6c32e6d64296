use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure reported by the remote executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionErrorKind {
    Syntax,
    Timeout,
    Generic,
}

impl ExecutionErrorKind {
    /// Classify a remote error message by substring, case-insensitively.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("syntax") {
            Self::Syntax
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else {
            Self::Generic
        }
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Timeout => write!(f, "timeout"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {operation} got no response after {}ms", .elapsed.as_millis())]
    Timeout { operation: String, elapsed: Duration },

    #[error("Execution error ({kind}): {message}")]
    Execution {
        kind: ExecutionErrorKind,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
