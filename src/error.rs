//! Error types for partest.

use thiserror::Error;

/// Main error type for partest.
#[derive(Error, Debug)]
pub enum PartestError {
    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("error from worker {worker}: {message}")]
    Worker { worker: usize, message: String },

    #[error("Pool is closed; no further jobs can be submitted")]
    Closed,

    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PartestError {
    /// Build a worker-fatal error.
    pub fn worker(worker: usize, message: impl Into<String>) -> Self {
        Self::Worker {
            worker,
            message: message.into(),
        }
    }

    /// Index of the failing worker, for worker-fatal errors.
    pub fn worker_index(&self) -> Option<usize> {
        match self {
            Self::Worker { worker, .. } | Self::Spawn { worker, .. } => Some(*worker),
            _ => None,
        }
    }
}

/// Result type alias for partest operations.
pub type Result<T> = std::result::Result<T, PartestError>;
