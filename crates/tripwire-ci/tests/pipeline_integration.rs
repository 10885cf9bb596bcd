//! Integration tests for the event pipeline with in-memory store and publisher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tripwire_ci::fakes::MemoryPublisher;
use tripwire_ci::{
    BackendError, BackendRegistry, BuildBackend, ChannelPublisher, CommandBackend, Pipeline,
    PipelineError,
};
use tripwire_core::{
    BuildPayload, BuildStatus, ChangeKey, ChangePayload, ChangeStore, JobStatus, Outcome,
    ServiceConfig,
};
use tripwire_state::fakes::MemoryChangeStore;

const TOPIC: &str = "build.completed";

/// Reports a fixed status for every build.
struct StaticBackend {
    name: &'static str,
    status: BuildStatus,
}

#[async_trait]
impl BuildBackend for StaticBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn build_proposal(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        self.build_change(payload).await
    }

    async fn build_change(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        let result = BuildPayload::for_change(self.name, payload, self.status, "build-1");
        Ok(serde_json::to_value(result).unwrap())
    }
}

/// Rejects every change in `validate_input`.
struct RejectingBackend;

#[async_trait]
impl BuildBackend for RejectingBackend {
    fn name(&self) -> &str {
        "picky"
    }

    fn validate_input(&self, _payload: &ChangePayload) -> Result<(), BackendError> {
        Err(BackendError::InvalidInput {
            backend: "picky".into(),
            reason: "unsupported repository".into(),
        })
    }

    async fn build_proposal(&self, _payload: &ChangePayload) -> Result<Value, BackendError> {
        unreachable!("validate_input rejects first")
    }

    async fn build_change(&self, _payload: &ChangePayload) -> Result<Value, BackendError> {
        unreachable!("validate_input rejects first")
    }
}

/// Never finishes within any sane timeout.
struct SlowBackend;

#[async_trait]
impl BuildBackend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    async fn build_proposal(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        self.build_change(payload).await
    }

    async fn build_change(&self, _payload: &ChangePayload) -> Result<Value, BackendError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!({}))
    }
}

/// Returns output that is missing `build_id`.
struct SloppyBackend;

#[async_trait]
impl BuildBackend for SloppyBackend {
    fn name(&self) -> &str {
        "sloppy"
    }

    async fn build_proposal(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        self.build_change(payload).await
    }

    async fn build_change(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        let mut value =
            serde_json::to_value(BuildPayload::for_change("sloppy", payload, BuildStatus::Success, "x"))
                .unwrap();
        value.as_object_mut().unwrap().remove("build_id");
        Ok(value)
    }
}

/// Panics mid-build.
struct PanickingBackend;

#[async_trait]
impl BuildBackend for PanickingBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn build_proposal(&self, _payload: &ChangePayload) -> Result<Value, BackendError> {
        panic!("backend bug");
    }

    async fn build_change(&self, _payload: &ChangePayload) -> Result<Value, BackendError> {
        panic!("backend bug");
    }
}

fn backend(b: impl BuildBackend + 'static) -> Arc<dyn BuildBackend> {
    Arc::new(b)
}

fn ok(name: &'static str) -> Arc<dyn BuildBackend> {
    backend(StaticBackend {
        name,
        status: BuildStatus::Success,
    })
}

fn registry(backends: Vec<Arc<dyn BuildBackend>>) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for backend in backends {
        registry.register(backend).unwrap();
    }
    registry
}

fn pipeline(
    backends: Vec<Arc<dyn BuildBackend>>,
) -> (Pipeline, Arc<MemoryChangeStore>, Arc<MemoryPublisher>) {
    let store = Arc::new(MemoryChangeStore::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let config = ServiceConfig {
        default_timeout_secs: 5,
        ..ServiceConfig::default()
    };
    let pipeline = Pipeline::new(store.clone(), registry(backends), publisher.clone(), config);
    (pipeline, store, publisher)
}

fn pr_opened(head: &str) -> Value {
    json!({
        "action": "opened",
        "number": 16,
        "pull_request": {
            "number": 16,
            "state": "open",
            "merged": false,
            "mergeable": true,
            "body": "adds widgets",
            "user": { "login": "octo" },
            "head": { "sha": head, "label": "octo:feature" },
            "base": { "sha": "base000", "ref": "main" }
        },
        "repository": { "id": 567, "name": "widgets" },
        "files": [
            { "filename": "a.go", "sha": "f1", "patch": "@@ -1,3 +1,4 @@\n a\n-b\n+B\n+C\n d\n" }
        ]
    })
}

fn push(after: &str) -> Value {
    json!({
        "ref": "refs/heads/main",
        "before": "aaa",
        "after": after,
        "repository": { "name": "widgets", "id": 567 },
        "pusher": { "name": "octo", "email": "octo@example.com" }
    })
}

fn pr_key() -> ChangeKey {
    ChangeKey::proposal("widgets", 16)
}

#[tokio::test]
async fn test_opened_pull_request_builds_on_every_backend() {
    let (pipeline, store, publisher) = pipeline(vec![ok("make"), ok("lint")]);

    let report = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::New);
    let dispatch = report.dispatch.expect("new change dispatches");
    assert_eq!(dispatch.published.len(), 2);
    assert!(dispatch.failures.is_empty());

    let payloads = publisher.payloads(TOPIC);
    assert_eq!(payloads.len(), 2);
    for payload in &payloads {
        assert_eq!(payload["change_id"], "16");
        assert_eq!(payload["sha"], "abc123");
        assert_eq!(payload["type"], "proposal");
    }

    let record = store.find(&pr_key()).await.unwrap().unwrap();
    assert_eq!(record.jobs.len(), 2);
    assert!(record.jobs.iter().all(|j| j.status == JobStatus::Success));
    assert_eq!(record.files[0].ranges.len(), 1);
}

#[tokio::test]
async fn test_one_failing_backend_does_not_block_siblings() {
    let (pipeline, store, publisher) =
        pipeline(vec![ok("make"), backend(RejectingBackend), ok("docs")]);

    let report = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();

    let dispatch = report.dispatch.unwrap();
    assert_eq!(publisher.len(), 2);
    assert_eq!(dispatch.failures.len(), 1);
    assert_eq!(dispatch.failures[0].backend, "picky");
    assert_eq!(dispatch.failures[0].stage, "validate_input");

    let record = store.find(&pr_key()).await.unwrap().unwrap();
    let failed: Vec<_> = record
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::Failure)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].backend, "picky");
}

#[tokio::test(start_paused = true)]
async fn test_slow_backend_times_out_while_siblings_publish() {
    let (pipeline, _store, publisher) = pipeline(vec![ok("make"), backend(SlowBackend)]);

    let report = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();

    let dispatch = report.dispatch.unwrap();
    assert_eq!(publisher.len(), 1);
    assert_eq!(dispatch.failures.len(), 1);
    assert_eq!(dispatch.failures[0].backend, "slow");
    assert_eq!(dispatch.failures[0].stage, "timeout");
    assert!(dispatch.failures[0].error.contains("5s"));
}

#[tokio::test]
async fn test_invalid_backend_output_is_not_published() {
    let (pipeline, _store, publisher) = pipeline(vec![backend(SloppyBackend), ok("make")]);

    let report = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();

    let dispatch = report.dispatch.unwrap();
    assert_eq!(publisher.len(), 1);
    assert_eq!(dispatch.failures[0].stage, "validate_output");
    assert!(dispatch.failures[0].error.contains("build_id"));
}

#[tokio::test]
async fn test_panicking_backend_is_isolated() {
    let (pipeline, _store, publisher) = pipeline(vec![backend(PanickingBackend), ok("make")]);

    let report = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();

    let dispatch = report.dispatch.unwrap();
    assert_eq!(publisher.len(), 1);
    assert_eq!(dispatch.failures[0].backend, "flaky");
}

#[tokio::test]
async fn test_all_backends_failing_keeps_classification() {
    let (pipeline, store, publisher) = pipeline(vec![backend(RejectingBackend)]);

    let report = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();
    assert!(report.dispatch.unwrap().all_failed());
    assert!(publisher.is_empty());

    // The record stays, so the same head is not rebuilt.
    assert!(store.find(&pr_key()).await.unwrap().is_some());
    let again = pipeline
        .ingest_webhook("pull_request", &pr_opened("abc123"))
        .await
        .unwrap();
    assert_eq!(again.outcome, Outcome::Unchanged);
    assert!(again.dispatch.is_none());
}

#[tokio::test]
async fn test_push_builds_once() {
    let (pipeline, _store, publisher) = pipeline(vec![ok("make")]);

    let first = pipeline.ingest_webhook("push", &push("bbb")).await.unwrap();
    let second = pipeline.ingest_webhook("push", &push("bbb")).await.unwrap();

    assert_eq!(first.outcome, Outcome::New);
    assert_eq!(second.outcome, Outcome::Unchanged);
    assert_eq!(publisher.len(), 1);

    let payload = &publisher.payloads(TOPIC)[0];
    assert_eq!(payload["change"], "aaa...bbb");
    assert_eq!(payload["change_id"], "bbb");
    assert_eq!(payload["type"], "change");
}

#[tokio::test]
async fn test_malformed_event_never_reaches_store() {
    let (pipeline, store, publisher) = pipeline(vec![ok("make")]);
    let mut body = push("bbb");
    body.as_object_mut().unwrap().remove("after");

    let err = pipeline.ingest_webhook("push", &body).await.unwrap_err();
    assert!(matches!(err, PipelineError::Event(_)));
    assert!(store.is_empty());
    assert!(publisher.is_empty());
}

#[tokio::test]
async fn test_queued_results_stay_pending() {
    let (pipeline, _store, publisher) = pipeline(vec![backend(StaticBackend {
        name: "remote",
        status: BuildStatus::Queued,
    })]);

    pipeline.ingest_webhook("push", &push("bbb")).await.unwrap();
    assert_eq!(publisher.len(), 1);

    let pending = pipeline.pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].1.backend, "remote");
    assert_eq!(pending[0].1.status, JobStatus::Started);
    assert_eq!(
        pending[0].0,
        ChangeKey::push("widgets", "refs/heads/main", "bbb")
    );
}

#[tokio::test]
async fn test_command_backends_end_to_end() {
    let store = Arc::new(MemoryChangeStore::new());
    let publisher = Arc::new(ChannelPublisher::new(16));
    let mut rx = publisher.subscribe();
    let registry = registry(vec![
        backend(CommandBackend::new("pass", vec!["true".into()]).unwrap()),
        backend(CommandBackend::new("fail", vec!["false".into()]).unwrap()),
    ]);
    let pipeline = Pipeline::new(store, registry, publisher, ServiceConfig::default());

    let report = pipeline.ingest_webhook("push", &push("bbb")).await.unwrap();
    let dispatch = report.dispatch.unwrap();
    // A failed build is still a valid result.
    assert_eq!(dispatch.published.len(), 2);

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, TOPIC);
        statuses.push(message.payload["status"].as_str().unwrap().to_string());
    }
    statuses.sort();
    assert_eq!(statuses, vec!["failure", "success"]);
}
