//! Error types for simrun.

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("runner is shut down and no longer accepts submissions")]
    Closed,

    #[error("job cancelled")]
    Cancelled,

    #[error("worker failed: {0}")]
    Worker(Arc<WorkerError>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure raised from inside [`Worker::run`](crate::engine::Worker::run).
///
/// `Cancelled` is how a worker reports that it observed the cancellation
/// signal; the runner treats it as a control-flow outcome, not a failure.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cancelled at checkpoint")]
    Cancelled,

    #[error("{program} exited with status {code}")]
    Program { program: String, code: i32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl WorkerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
