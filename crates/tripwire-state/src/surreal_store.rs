//! SurrealDB-backed ChangeStore implementation
//!
//! Uses `schema::ChangeRow` and `schema::JobRow` for persistence,
//! converting to/from `storage_traits` types at the boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, warn};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{ChangeRow, JobRow};
use crate::storage_traits::{
    ChangeKey, ChangeRecord, ChangeStore, Job, JobId, JobStatus, StorageResult,
};

const NAMESPACE: &str = "tripwire";
const DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".tripwire/db";

fn backend_err(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Unique index violations surface as "Database index `...` already contains ...".
fn is_unique_violation(e: &surrealdb::Error) -> bool {
    e.to_string().contains("already contains")
}

/// Optimistic transaction conflicts between concurrent writers.
fn is_retryable(e: &surrealdb::Error) -> bool {
    e.to_string().contains("can be retried")
}

const MAX_CONFLICT_RETRIES: usize = 5;

/// SurrealDB-backed implementation of [`ChangeStore`].
#[derive(Clone)]
pub struct SurrealChangeStore {
    db: Surreal<Any>,
}

impl SurrealChangeStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `tripwire/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to `url`, select `tripwire/main`, and run `init_schema`.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        if let (Ok(username), Ok(password)) = (
            std::env::var("SURREALDB_USER"),
            std::env::var("SURREALDB_PASS"),
        ) {
            if !url.starts_with("mem://") && !url.starts_with("surrealkv://") {
                use surrealdb::opt::auth::Root;
                db.signin(Root {
                    username: &username,
                    password: &password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
            }
        }

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url, "SurrealChangeStore connected");
        Ok(Self { db })
    }

    /// Create from environment variables.
    ///
    /// Uses `SURREALDB_URL` when set, otherwise local persistence under
    /// `.tripwire/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }

        std::fs::create_dir_all(DEFAULT_LOCAL_PATH).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {DEFAULT_LOCAL_PATH}: {e}"
            ))
        })?;
        let url = format!("surrealkv://{DEFAULT_LOCAL_PATH}");
        info!("No SURREALDB_URL found, using local persistence: {}", url);
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_row(&self, change_key: &str) -> StorageResult<Option<ChangeRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM changes WHERE change_key = $key")
            .bind(("key", change_key.to_string()))
            .await
            .map_err(backend_err)?;

        let rows: Vec<ChangeRow> = res.take(0).map_err(backend_err)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_jobs(&self, change_key: &str) -> StorageResult<Vec<Job>> {
        let mut res = self
            .db
            .query("SELECT * FROM jobs WHERE change_key = $key ORDER BY created_at ASC")
            .bind(("key", change_key.to_string()))
            .await
            .map_err(backend_err)?;

        let rows: Vec<JobRow> = res.take(0).map_err(backend_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Replace the content of an existing row. Returns `false` if no row matched.
    async fn replace_row(&self, row: ChangeRow) -> StorageResult<bool> {
        let change_key = row.change_key.clone();
        let mut res = self
            .db
            .query("UPDATE changes CONTENT $row WHERE change_key = $key")
            .bind(("row", row))
            .bind(("key", change_key))
            .await
            .map_err(backend_err)?;

        let updated: Vec<ChangeRow> = res.take(0).map_err(backend_err)?;
        Ok(!updated.is_empty())
    }

    /// Replace a row whose head is still `expected_head`, retrying conflicted
    /// transactions. A retry re-checks the head, so a concurrent winner makes
    /// this return `false`.
    async fn replace_row_if_head(
        &self,
        row: ChangeRow,
        expected_head: &str,
    ) -> StorageResult<bool> {
        let mut attempt = 0;
        loop {
            let res = self
                .db
                .query("UPDATE changes CONTENT $row WHERE change_key = $key AND head = $old")
                .bind(("row", row.clone()))
                .bind(("key", row.change_key.clone()))
                .bind(("old", expected_head.to_string()))
                .await
                .and_then(|mut res| res.take::<Vec<ChangeRow>>(0));
            match res {
                Ok(updated) => return Ok(!updated.is_empty()),
                Err(e) if is_retryable(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(change_key = %row.change_key, attempt, "retrying conflicted head swap");
                }
                Err(e) => return Err(backend_err(e)),
            }
        }
    }

    /// Create a row, retrying transactions that lost an optimistic conflict.
    async fn create_row(&self, row: ChangeRow) -> Result<(), surrealdb::Error> {
        let mut attempt = 0;
        loop {
            let created: Result<Option<ChangeRow>, _> =
                self.db.create("changes").content(row.clone()).await;
            match created {
                Ok(_) => return Ok(()),
                Err(e) if is_retryable(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(change_key = %row.change_key, attempt, "retrying conflicted create");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ChangeStore for SurrealChangeStore {
    async fn find(&self, key: &ChangeKey) -> StorageResult<Option<ChangeRecord>> {
        let change_key = key.storage_key();
        let Some(row) = self.fetch_row(&change_key).await? else {
            return Ok(None);
        };
        let jobs = self.fetch_jobs(&change_key).await?;
        row.into_record(jobs).map(Some)
    }

    async fn upsert(&self, record: ChangeRecord) -> StorageResult<()> {
        let row = ChangeRow::from_record(&record);
        debug!(key = %record.key, "upserting change");

        if self.replace_row(row.clone()).await? {
            return Ok(());
        }
        match self.create_row(row.clone()).await {
            Ok(()) => Ok(()),
            // Another writer created the row between our update and create.
            Err(e) if is_unique_violation(&e) => {
                if self.replace_row(row).await? {
                    Ok(())
                } else {
                    Err(StorageError::Backend(format!(
                        "upsert of {} lost the row it raced against",
                        record.key
                    )))
                }
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn insert_if_absent(&self, record: ChangeRecord) -> StorageResult<bool> {
        let row = ChangeRow::from_record(&record);
        match self.create_row(row).await {
            Ok(()) => {
                debug!(key = %record.key, "inserted change");
                Ok(true)
            }
            Err(e) if is_unique_violation(&e) => {
                debug!(key = %record.key, "change already present");
                Ok(false)
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn replace_if_head(
        &self,
        record: ChangeRecord,
        expected_head: &str,
    ) -> StorageResult<bool> {
        let row = ChangeRow::from_record(&record);
        let swapped = self.replace_row_if_head(row, expected_head).await?;
        debug!(key = %record.key, expected_head, swapped, "compare-and-swap on head");
        Ok(swapped)
    }

    async fn append_job(&self, key: &ChangeKey, job: Job) -> StorageResult<()> {
        let change_key = key.storage_key();
        if self.fetch_row(&change_key).await?.is_none() {
            return Err(StorageError::NotFound { key: change_key });
        }

        debug!(key = %key, job_id = %job.id, backend = %job.backend, "appending job");
        let _created: Option<JobRow> = self
            .db
            .create("jobs")
            .content(JobRow::new(change_key, &job))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<String>,
    ) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE jobs SET status = $status, result = $result, updated_at = $now \
                 WHERE job_id = $jid",
            )
            .bind(("status", status.as_str().to_string()))
            .bind(("result", result))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("jid", job_id.0.clone()))
            .await
            .map_err(backend_err)?;

        let updated: Vec<JobRow> = res.take(0).map_err(backend_err)?;
        if updated.is_empty() {
            return Err(StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            });
        }
        Ok(())
    }

    async fn mark_reported(
        &self,
        key: &ChangeKey,
        filename: &str,
        line: u32,
    ) -> StorageResult<()> {
        let change_key = key.storage_key();
        let mut row = self
            .fetch_row(&change_key)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                key: change_key.clone(),
            })?;

        let file = row
            .files
            .iter_mut()
            .find(|f| f.filename == filename)
            .ok_or_else(|| StorageError::FileNotFound {
                key: change_key.clone(),
                filename: filename.to_string(),
            })?;
        if !file.reported.insert(line) {
            return Ok(());
        }

        row.id = None;
        if !self.replace_row(row).await? {
            warn!(key = %key, "record vanished while marking line reported");
            return Err(StorageError::NotFound { key: change_key });
        }
        Ok(())
    }

    async fn find_jobs_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> StorageResult<Vec<(ChangeKey, Job)>> {
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let mut res = self
            .db
            .query("SELECT * FROM jobs WHERE status IN $statuses ORDER BY created_at ASC")
            .bind(("statuses", wanted))
            .await
            .map_err(backend_err)?;
        let rows: Vec<JobRow> = res.take(0).map_err(backend_err)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut change_keys: Vec<String> = rows.iter().map(|r| r.change_key.clone()).collect();
        change_keys.sort();
        change_keys.dedup();

        let mut res = self
            .db
            .query("SELECT * FROM changes WHERE change_key IN $keys")
            .bind(("keys", change_keys))
            .await
            .map_err(backend_err)?;
        let changes: Vec<ChangeRow> = res.take(0).map_err(backend_err)?;

        let mut keys = HashMap::with_capacity(changes.len());
        for change in &changes {
            keys.insert(change.change_key.clone(), change.key()?);
        }

        rows.into_iter()
            .map(|row| {
                let key = keys
                    .get(&row.change_key)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound {
                        key: row.change_key.clone(),
                    })?;
                Ok((key, row.into_job()?))
            })
            .collect()
    }
}
