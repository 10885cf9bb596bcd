//! Domain models for Tripwire.
//!
//! Canonical definitions for the payloads handed from stage to stage:
//! - `ChangePayload`: a change to build (pull request or push)
//! - `BuildPayload`: the outcome a build backend reports for a change
//!
//! plus the schema validator both pass through.

pub mod error;
pub mod payload;
pub mod validation;

pub use error::{ClassificationError, ClassifyError, ConfigError, Result, SchemaError};
pub use payload::{BuildPayload, BuildStatus, ChangePayload, ChangeType};
pub use validation::{validate, FieldRule, PayloadSchema, BUILD_SCHEMA, CHANGE_SCHEMA};
