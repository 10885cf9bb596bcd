//! Tripwire Core Library
//!
//! Turns hosting-service change events into build-trigger decisions:
//!
//! - `event`: normalise `(event name, JSON body)` into a [`ChangeEvent`]
//! - `diff`: unified-diff hunk parsing and diff-position translation
//! - `domain`: change/build payloads and their schema validator
//! - `directive`: `@service-account retest|ignore` parsing
//! - `classify`: the [`EventClassifier`] state machine over the change store
//! - `config`, `telemetry`, `obs`: service configuration and logging

pub mod classify;
pub mod config;
pub mod diff;
pub mod directive;
pub mod domain;
pub mod event;
pub mod obs;
pub mod telemetry;

pub use classify::{Classification, EventClassifier, Outcome};
pub use config::{BackendConfig, ServiceConfig};
pub use diff::{parse_patch, FileDiff};
pub use directive::{has_directive, parse_directive, Directive};
pub use domain::{
    validate, BuildPayload, BuildStatus, ChangePayload, ChangeType, ClassificationError,
    ClassifyError, ConfigError, PayloadSchema, SchemaError, BUILD_SCHEMA, CHANGE_SCHEMA,
};
pub use event::{
    ChangeEvent, ChangedFile, CommentEvent, PullRequestAction, PullRequestEvent, PushEvent,
    ReviewComment,
};

pub use tripwire_state::{
    ChangeKey, ChangeRecord, ChangeStatus, ChangeStore, FileRecord, Job, JobId, JobStatus, Range,
    StorageError,
};
