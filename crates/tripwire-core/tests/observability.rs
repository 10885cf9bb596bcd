//! Observability tests for the change pipeline lifecycle events.

use std::sync::Arc;

use serde_json::json;
use tracing_test::traced_test;
use tripwire_core::obs::{
    emit_backend_failed, emit_build_dispatched, emit_event_classified, emit_job_bookkeeping_error,
    emit_payload_published,
};
use tripwire_core::{ChangeEvent, EventClassifier, ServiceConfig};
use tripwire_state::fakes::MemoryChangeStore;

#[traced_test]
#[test]
fn test_emit_event_classified_logs_outcome() {
    emit_event_classified("push/widgets/refs/heads/main/bbb", "push", "new", true);
    assert!(logs_contain("event.classified"));
    assert!(logs_contain("outcome=new"));
}

#[traced_test]
#[test]
fn test_emit_build_dispatched_logs_backend_count() {
    emit_build_dispatched("proposal/widgets/16", "abc123", 3);
    assert!(logs_contain("build.dispatched"));
    assert!(logs_contain("backends=3"));
}

#[traced_test]
#[test]
fn test_backend_failure_is_a_warning() {
    emit_backend_failed("proposal/widgets/16", "make", &"timed out after 600s");
    assert!(logs_contain("WARN"));
    assert!(logs_contain("backend=make"));
}

#[traced_test]
#[test]
fn test_emit_payload_published_logs_topic() {
    emit_payload_published("proposal/widgets/16", "make", "build.completed", "success");
    assert!(logs_contain("topic=build.completed"));
}

#[traced_test]
#[test]
fn test_job_bookkeeping_error_logs_job() {
    emit_job_bookkeeping_error("proposal/widgets/16", "job-1", &"store unavailable");
    assert!(logs_contain("job.bookkeeping_error"));
    assert!(logs_contain("job-1"));
}

#[traced_test]
#[tokio::test]
async fn test_classifier_emits_classification() {
    let store = Arc::new(MemoryChangeStore::new());
    let classifier = EventClassifier::new(store, Arc::new(ServiceConfig::default()));
    let event = ChangeEvent::from_webhook(
        "push",
        &json!({
            "ref": "refs/heads/main",
            "before": "aaa",
            "after": "bbb",
            "repository": { "name": "widgets" },
            "pusher": { "name": "octo", "email": "octo@example.com" }
        }),
    )
    .unwrap();

    classifier.classify(&event).await.unwrap();
    assert!(logs_contain("event.classified"));
    assert!(logs_contain("kind=push"));
    assert!(logs_contain("change=push/widgets/refs/heads/main/bbb"));
}
