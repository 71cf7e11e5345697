//! Error types for the jobwright engine

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for jobwright operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid static processor configuration.
    ///
    /// Raised at construction time, never at request time.
    #[error("configuration error: {0}")]
    Config(String),

    /// An output artifact already exists at the resolved path
    #[error("output artifact already exists: {0}")]
    Conflict(PathBuf),

    /// The submitted request is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Local filesystem error
    #[error("io error at {path}: {source}")]
    Io {
        /// Path of the file the operation touched
        path: PathBuf,
        /// Underlying io error
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The executing workload failed.
    ///
    /// Carries a fixed error code plus a user-safe description; the raw
    /// internal failure text is logged, never echoed here.
    #[error("{code}: {message}")]
    Workload {
        /// Stable error code
        code: &'static str,
        /// Sanitized description
        message: String,
    },

    /// The result artifact is missing, unreadable or malformed
    #[error("result artifact error: {0}")]
    Artifact(String),

    /// No job with the given identifier exists
    #[error("no such job: {0}")]
    NotFound(String),

    /// The job exists but has not reached a terminal state yet
    #[error("job not finished: {0}")]
    NotFinished(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-request error with the given message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an artifact error with the given message
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Wrap an io error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
