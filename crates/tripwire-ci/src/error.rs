//! Error types for build fan-out and publication.

use tripwire_core::{ClassificationError, ClassifyError, SchemaError};

/// Errors produced by one build-backend branch.
///
/// A backend error fails only its own branch; siblings still run and publish.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend {backend} rejected the change: {reason}")]
    InvalidInput { backend: String, reason: String },

    #[error("backend {backend} could not start the build: {reason}")]
    Spawn { backend: String, reason: String },

    #[error("backend {backend} timed out after {secs}s")]
    Timeout { backend: String, secs: u64 },

    #[error("backend {backend} panicked or was aborted")]
    Panicked { backend: String },

    #[error("backend {backend} returned an invalid build payload: {source}")]
    InvalidOutput {
        backend: String,
        #[source]
        source: SchemaError,
    },

    #[error("backend {backend} reported {field} {actual}, expected {expected}")]
    Mismatch {
        backend: String,
        field: &'static str,
        expected: String,
        actual: String,
    },
}

impl BackendError {
    pub fn backend(&self) -> &str {
        match self {
            BackendError::InvalidInput { backend, .. }
            | BackendError::Spawn { backend, .. }
            | BackendError::Timeout { backend, .. }
            | BackendError::Panicked { backend }
            | BackendError::InvalidOutput { backend, .. }
            | BackendError::Mismatch { backend, .. } => backend,
        }
    }

    /// Short stage name of the failure, for reports.
    pub fn stage(&self) -> &'static str {
        match self {
            BackendError::InvalidInput { .. } => "validate_input",
            BackendError::Spawn { .. } | BackendError::Panicked { .. } => "build",
            BackendError::Timeout { .. } => "timeout",
            BackendError::InvalidOutput { .. } | BackendError::Mismatch { .. } => {
                "validate_output"
            }
        }
    }
}

/// Errors delivering a build payload to subscribers.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("no subscribers for topic {topic}")]
    NoSubscribers { topic: String },

    #[error("publisher rejected payload on {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}

/// Errors registering build backends.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backend {0} is already registered")]
    Duplicate(String),

    #[error("backend {0} has no command")]
    EmptyCommand(String),
}

/// Errors that stop the pipeline for one event.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("rejected event: {0}")]
    Event(#[from] ClassificationError),

    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),

    #[error("payload for {key} failed validation before {stage}: {source}")]
    Schema {
        stage: &'static str,
        key: String,
        #[source]
        source: SchemaError,
    },

    #[error("store error during {stage}: {source}")]
    Store {
        stage: &'static str,
        #[source]
        source: tripwire_state::StorageError,
    },
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
