//! Tripwire-State: change-record persistence for Tripwire
//!
//! This crate is the single point of serialisation for the classification
//! pipeline. Webhook and poll ingress may race on the same change; every
//! mutation goes through the key-scoped operations of [`ChangeStore`].
//!
//! ## Key Components
//!
//! - `ChangeStore`: async store contract (find, upsert, atomic insert-if-absent, jobs)
//! - `ChangeRecord`: per-(repo, change) or per-(repo, ref, sha) record
//! - `MemoryChangeStore`: in-process store for tests and one-shot runs (`fakes` module)
//! - `SurrealChangeStore`: SurrealDB-backed implementation

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use migrations::init_schema;
pub use storage_traits::{
    ChangeKey, ChangeRecord, ChangeStatus, ChangeStore, FileRecord, Job, JobId, JobStatus, Range,
    StorageResult,
};
pub use surreal_store::SurrealChangeStore;

/// Result type for connection and schema setup
pub type Result<T> = std::result::Result<T, StateError>;
