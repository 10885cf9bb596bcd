//! Error types for tripwire-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by [`crate::ChangeStore`] operations.
///
/// Callers must treat every variant as "state unknown": in particular a
/// failed lookup is never evidence that a change is new.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record stored under the key
    #[error("change record not found: {key}")]
    NotFound { key: String },

    /// No job with this id on any record
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// The record exists but does not track this file
    #[error("file {filename} is not tracked on {key}")]
    FileNotFound { key: String, filename: String },

    /// A stored value could not be decoded
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// Backend unavailable or query rejected
    #[error("storage backend error: {0}")]
    Backend(String),
}
