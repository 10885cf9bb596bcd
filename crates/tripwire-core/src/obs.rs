//! Structured observability hooks for the change pipeline.
//!
//! Emission functions for pipeline lifecycle events. Change-scoped spans
//! come from `#[instrument]` on the classifier, pipeline and orchestrator
//! entry points, so these only add the event fields.
//!
//! Events are emitted at `info!` level (failures at `warn!`) with an
//! `event` field naming them, so they can be filtered in JSON output.

use tracing::{info, warn};

/// Emit event: an inbound event was classified.
pub fn emit_event_classified(change: &str, event_kind: &str, outcome: &str, triggers: bool) {
    info!(
        event = "event.classified",
        change = %change,
        kind = %event_kind,
        outcome = %outcome,
        triggers = triggers,
    );
}

/// Emit event: a build was dispatched to `backends` backends.
pub fn emit_build_dispatched(change: &str, sha: &str, backends: usize) {
    info!(event = "build.dispatched", change = %change, sha = %sha, backends = backends);
}

/// Emit event: one backend branch failed.
pub fn emit_backend_failed(change: &str, backend: &str, error: &dyn std::fmt::Display) {
    warn!(event = "backend.failed", change = %change, backend = %backend, error = %error);
}

/// Emit event: a build result was published.
pub fn emit_payload_published(change: &str, backend: &str, topic: &str, status: &str) {
    info!(
        event = "payload.published",
        change = %change,
        backend = %backend,
        topic = %topic,
        status = %status,
    );
}

/// Emit event: job bookkeeping could not be written (warning level).
pub fn emit_job_bookkeeping_error(change: &str, job_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.bookkeeping_error", change = %change, job_id = %job_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_without_subscriber() {
        emit_event_classified("proposal/widgets/1", "pull_request", "new", true);
        emit_job_bookkeeping_error("proposal/widgets/1", "job-1", &"down");
    }
}
