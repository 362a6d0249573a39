use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::CorrelationId;

/// Errors surfaced by the master/worker offload engine.
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no workers available")]
    NoWorkers,

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("worker {0} is unavailable")]
    WorkerUnavailable(usize),

    #[error("worker {worker} did not signal ready within {timeout:?}")]
    WorkerStartupTimeout { worker: usize, timeout: Duration },

    #[error("call to '{operation}' timed out after {timeout:?}")]
    CallTimeout {
        operation: String,
        timeout: Duration,
    },

    #[error("reply references unknown correlation id {0}")]
    CorrelationMismatch(CorrelationId),

    #[error("operation '{operation}' failed: {message}")]
    OperationFailed { operation: String, message: String },

    #[error("pool is not locked: call lock() before run()")]
    NotLocked,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("result decode error: {0}")]
    ResultDecode(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OffloadError {
    /// Rebuild a master-side error from a worker's error reply.
    pub fn from_remote(operation: &str, remote: RemoteError) -> Self {
        match remote.kind {
            RemoteErrorKind::UnknownOperation => Self::UnknownOperation(operation.to_string()),
            _ => Self::OperationFailed {
                operation: operation.to_string(),
                message: remote.to_string(),
            },
        }
    }
}

/// Error raised by a user operation inside a worker.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("missing argument at position {0}")]
    MissingArgument(usize),

    #[error("invalid argument at position {position}: {message}")]
    InvalidArgument { position: usize, message: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Classification of a failure reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    UnknownOperation,
    InvalidArguments,
    OperationFailed,
    PartialApplication,
    Panicked,
}

/// Error payload carried by a reply instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<OperationError> for RemoteError {
    fn from(err: OperationError) -> Self {
        let kind = match err {
            OperationError::MissingArgument(_) | OperationError::InvalidArgument { .. } => {
                RemoteErrorKind::InvalidArguments
            }
            OperationError::Failed(_) | OperationError::Other(_) => {
                RemoteErrorKind::OperationFailed
            }
        };
        Self::new(kind, err.to_string())
    }
}
