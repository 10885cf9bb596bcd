//! Concurrent build fan-out.
//!
//! One branch per enabled backend. Each branch records a job, runs the
//! backend in its own task under the configured timeout, validates the
//! result and publishes it. A failing branch never affects its siblings; the
//! dispatch joins on every branch before reporting.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, instrument};
use tripwire_core::obs;
use tripwire_core::{
    BuildPayload, BuildStatus, ChangeKey, ChangePayload, ChangeStore, Job, JobId, JobStatus,
    ServiceConfig,
};

use crate::backend::{BackendRegistry, BuildBackend};
use crate::error::BackendError;
use crate::publisher::ResultPublisher;

/// A backend branch that did not produce a published result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub stage: &'static str,
    pub error: String,
}

/// Settled results of one dispatch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub change: String,
    pub sha: String,
    /// Validated results that reached the publisher
    pub published: Vec<BuildPayload>,
    pub failures: Vec<BackendFailure>,
}

impl DispatchReport {
    pub fn all_failed(&self) -> bool {
        self.published.is_empty() && !self.failures.is_empty()
    }
}

/// Fans a validated change payload out to every registered backend.
pub struct BuildOrchestrator {
    registry: BackendRegistry,
    store: Arc<dyn ChangeStore>,
    publisher: Arc<dyn ResultPublisher>,
    config: Arc<ServiceConfig>,
}

impl BuildOrchestrator {
    pub fn new(
        registry: BackendRegistry,
        store: Arc<dyn ChangeStore>,
        publisher: Arc<dyn ResultPublisher>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            registry,
            store,
            publisher,
            config,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Build `payload` on every backend and publish each valid result.
    ///
    /// The change record for `key` must already exist; job bookkeeping
    /// failures are logged and do not fail a branch.
    #[instrument(skip(self, payload), fields(change = %key, sha = %payload.sha()))]
    pub async fn dispatch(&self, key: &ChangeKey, payload: &ChangePayload) -> DispatchReport {
        let change = key.storage_key();
        obs::emit_build_dispatched(&change, payload.sha(), self.registry.len());

        let payload = Arc::new(payload.clone());
        let branches = self
            .registry
            .backends()
            .iter()
            .map(|backend| self.run_branch(key, Arc::clone(backend), Arc::clone(&payload)));
        let outcomes = join_all(branches).await;

        let mut report = DispatchReport {
            change: change.clone(),
            sha: payload.sha().to_string(),
            ..DispatchReport::default()
        };
        for (backend, outcome) in self.registry.names().into_iter().zip(outcomes) {
            match outcome {
                Ok(result) => report.published.push(result),
                Err(failure) => {
                    debug!(backend = %backend, stage = failure.stage, "branch settled without result");
                    report.failures.push(failure);
                }
            }
        }
        report
    }

    async fn run_branch(
        &self,
        key: &ChangeKey,
        backend: Arc<dyn BuildBackend>,
        payload: Arc<ChangePayload>,
    ) -> Result<BuildPayload, BackendFailure> {
        let change = key.storage_key();
        let name = backend.name().to_string();

        let job = Job::new(&name);
        let job_id = job.id.clone();
        let tracked = match self.store.append_job(key, job).await {
            Ok(()) => {
                self.set_job(&change, &job_id, JobStatus::Started, None).await;
                true
            }
            Err(e) => {
                obs::emit_job_bookkeeping_error(&change, &job_id.to_string(), &e);
                false
            }
        };

        let result = self.execute(backend, payload).await;

        let (status, summary) = match &result {
            Ok(build) => (job_status_for(build.status), build.status.to_string()),
            Err(e) => (JobStatus::Failure, e.to_string()),
        };
        if tracked {
            self.set_job(&change, &job_id, status, Some(summary)).await;
        }

        let build = result.map_err(|e| {
            obs::emit_backend_failed(&change, &name, &e);
            BackendFailure {
                backend: name.clone(),
                stage: e.stage(),
                error: e.to_string(),
            }
        })?;

        let value = build.to_value().map_err(|e| BackendFailure {
            backend: name.clone(),
            stage: "validate_output",
            error: e.to_string(),
        })?;
        let topic = &self.config.publish_topic;
        if let Err(e) = self.publisher.publish(topic, &value).await {
            obs::emit_backend_failed(&change, &name, &e);
            return Err(BackendFailure {
                backend: name,
                stage: "publish",
                error: e.to_string(),
            });
        }
        obs::emit_payload_published(&change, &name, topic, build.status.as_str());
        Ok(build)
    }

    /// Run the backend workflow in its own task, bounded by its timeout.
    async fn execute(
        &self,
        backend: Arc<dyn BuildBackend>,
        payload: Arc<ChangePayload>,
    ) -> Result<BuildPayload, BackendError> {
        let name = backend.name().to_string();
        let limit = self.config.timeout_for(&name);

        let mut handle = tokio::spawn(run_workflow(backend, payload));
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(_join)) => Err(BackendError::Panicked { backend: name }),
            Err(_elapsed) => {
                handle.abort();
                Err(BackendError::Timeout {
                    backend: name,
                    secs: limit.as_secs(),
                })
            }
        }
    }

    async fn set_job(&self, change: &str, job_id: &JobId, status: JobStatus, result: Option<String>) {
        if let Err(e) = self.store.update_job_status(job_id, status, result).await {
            obs::emit_job_bookkeeping_error(change, &job_id.to_string(), &e);
        }
    }
}

async fn run_workflow(
    backend: Arc<dyn BuildBackend>,
    payload: Arc<ChangePayload>,
) -> Result<BuildPayload, BackendError> {
    let name = backend.name().to_string();
    backend.validate_input(&payload)?;
    backend.prepare(&payload).await?;
    let value = backend.build(&payload).await?;

    let build = BuildPayload::from_value(value).map_err(|source| BackendError::InvalidOutput {
        backend: name.clone(),
        source,
    })?;
    check_identity(&name, &build, &payload)?;
    Ok(build)
}

fn check_identity(
    name: &str,
    build: &BuildPayload,
    payload: &ChangePayload,
) -> Result<(), BackendError> {
    if build.backend == name && build.matches(payload) {
        return Ok(());
    }
    let pairs = [
        ("backend", name, build.backend.as_str()),
        ("repo", payload.repo.as_str(), build.repo.as_str()),
        ("change_id", payload.change_id.as_str(), build.change_id.as_str()),
        ("sha", payload.sha(), build.sha.as_str()),
    ];
    for (field, expected, actual) in pairs {
        if expected != actual {
            return Err(BackendError::Mismatch {
                backend: name.to_string(),
                field,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

/// Queued and building results leave the job started, so pending-job
/// queries still see it.
fn job_status_for(status: BuildStatus) -> JobStatus {
    match status {
        BuildStatus::Success => JobStatus::Success,
        BuildStatus::Failure | BuildStatus::Error => JobStatus::Failure,
        BuildStatus::Queued | BuildStatus::Building => JobStatus::Started,
    }
}
