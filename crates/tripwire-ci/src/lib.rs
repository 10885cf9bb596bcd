//! Tripwire CI - build fan-out for classified changes
//!
//! Provides:
//! - The [`BuildBackend`] contract and a startup-built [`BackendRegistry`]
//! - [`CommandBackend`], which runs a configured program per build
//! - [`BuildOrchestrator`], concurrent per-backend branches with isolated failures
//! - [`ResultPublisher`] implementations for delivering build payloads
//! - [`Pipeline`], the context object wiring classification to publication

pub mod backend;
pub mod command;
pub mod error;
pub mod fakes;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;

pub use backend::{BackendRegistry, BuildBackend};
pub use command::{CommandBackend, CommandOutput};
pub use error::{BackendError, PipelineError, PublishError, RegistryError, Result};
pub use orchestrator::{BackendFailure, BuildOrchestrator, DispatchReport};
pub use pipeline::{IngestReport, Pipeline};
pub use publisher::{ChannelPublisher, Published, ResultPublisher};
