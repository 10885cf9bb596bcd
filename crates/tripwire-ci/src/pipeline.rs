//! Event-to-publication pipeline.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};
use tripwire_core::{
    ChangeEvent, ChangeKey, ChangePayload, ChangeStore, EventClassifier, Job, JobStatus, Outcome,
    ServiceConfig,
};

use crate::backend::BackendRegistry;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{BuildOrchestrator, DispatchReport};
use crate::publisher::ResultPublisher;

/// What happened to one inbound event.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Event kind (`pull_request`, `push`, `issue_comment`)
    pub event: &'static str,
    pub change: String,
    pub outcome: Outcome,
    /// Present when the outcome triggered a build
    pub dispatch: Option<DispatchReport>,
    pub duration_ms: u64,
}

/// Explicit context for processing events: store, classifier, backends,
/// publisher and configuration, wired once at startup.
pub struct Pipeline {
    classifier: EventClassifier,
    orchestrator: BuildOrchestrator,
    store: Arc<dyn ChangeStore>,
    config: Arc<ServiceConfig>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ChangeStore>,
        registry: BackendRegistry,
        publisher: Arc<dyn ResultPublisher>,
        config: ServiceConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            classifier: EventClassifier::new(Arc::clone(&store), Arc::clone(&config)),
            orchestrator: BuildOrchestrator::new(
                registry,
                Arc::clone(&store),
                publisher,
                Arc::clone(&config),
            ),
            store,
            config,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChangeStore> {
        &self.store
    }

    /// Normalise a webhook delivery, then [`ingest`](Self::ingest) it.
    ///
    /// Malformed bodies are rejected before the store is touched.
    pub async fn ingest_webhook(&self, event_name: &str, body: &Value) -> Result<IngestReport> {
        let event = ChangeEvent::from_webhook(event_name, body)?;
        self.ingest(&event).await
    }

    /// Classify `event` and, when it triggers, build and publish.
    ///
    /// Classification is recorded before dispatch and is kept even if every
    /// backend fails.
    #[instrument(skip(self, event), fields(kind = event.kind(), change = %event.key()))]
    pub async fn ingest(&self, event: &ChangeEvent) -> Result<IngestReport> {
        let start = Instant::now();
        let classification = self.classifier.classify(event).await?;
        let change = classification.key.storage_key();

        let dispatch = match classification.payload {
            Some(payload) if classification.outcome.triggers_build() => {
                let payload = revalidate(&classification.key, payload)?;
                Some(self.orchestrator.dispatch(&classification.key, &payload).await)
            }
            _ => None,
        };

        if let Some(report) = &dispatch {
            info!(
                change = %change,
                published = report.published.len(),
                failed = report.failures.len(),
                "dispatch settled"
            );
        }

        Ok(IngestReport {
            event: event.kind(),
            change,
            outcome: classification.outcome,
            dispatch,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Jobs still `new` or `started`, oldest first.
    pub async fn pending_jobs(&self) -> Result<Vec<(ChangeKey, Job)>> {
        self.store
            .find_jobs_by_status(&[JobStatus::New, JobStatus::Started])
            .await
            .map_err(|source| PipelineError::Store {
                stage: "pending_jobs",
                source,
            })
    }
}

/// Round-trip the payload through the change schema before it leaves the
/// classifier's hands.
fn revalidate(key: &ChangeKey, payload: ChangePayload) -> Result<ChangePayload> {
    let schema_error = |source| PipelineError::Schema {
        stage: "dispatch",
        key: key.to_string(),
        source,
    };
    let value = payload.to_value().map_err(schema_error)?;
    ChangePayload::from_value(value).map_err(schema_error)
}
