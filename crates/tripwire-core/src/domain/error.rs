//! Domain-level error taxonomy for Tripwire.

use tripwire_state::StorageError;

/// Errors produced by payload schema validation.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("{schema} payload must be a JSON object")]
    NotAnObject { schema: &'static str },

    #[error("{schema} payload missing required field: {field}")]
    MissingField { schema: &'static str, field: String },

    #[error("{schema} payload field {field} has invalid value {value}")]
    InvalidValue {
        schema: &'static str,
        field: String,
        value: String,
    },

    #[error("{schema} payload could not be decoded: {reason}")]
    Decode { schema: &'static str, reason: String },
}

impl SchemaError {
    /// Name of the offending field, if the error concerns one.
    pub fn field(&self) -> Option<&str> {
        match self {
            SchemaError::MissingField { field, .. } | SchemaError::InvalidValue { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }
}

/// Errors produced while normalising a raw hosting-service event.
///
/// These are raised before classification; a rejected event never reaches the store.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),

    #[error("{event} event missing required field: {field}")]
    MissingField { event: String, field: String },

    #[error("{event} event field {field} is malformed: {reason}")]
    Malformed {
        event: String,
        field: String,
        reason: String,
    },

    #[error("{event} event produced an invalid change payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: SchemaError,
    },
}

/// Errors returned by the event classifier.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("store error during {stage} for {key}: {source}")]
    Store {
        stage: &'static str,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("invalid stored payload for {key}: {source}")]
    Schema {
        key: String,
        #[source]
        source: SchemaError,
    },
}

impl ClassifyError {
    pub(crate) fn store(stage: &'static str, key: impl ToString, source: StorageError) -> Self {
        ClassifyError::Store {
            stage,
            key: key.to_string(),
            source,
        }
    }
}

/// Errors raised while loading or validating service configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("service_account must not be empty")]
    EmptyServiceAccount,

    #[error("duplicate backend name: {0}")]
    DuplicateBackend(String),

    #[error("backend {0} is enabled but has no command")]
    EmptyCommand(String),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Result type for schema validation.
pub type Result<T> = std::result::Result<T, SchemaError>;
