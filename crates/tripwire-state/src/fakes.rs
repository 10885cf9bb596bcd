//! In-process storage
//!
//! Provides `MemoryChangeStore`, which satisfies the full `ChangeStore`
//! contract without any external dependencies. Tests use it as a fake, and
//! the CLI uses it for one-shot runs (`ingest --in-memory`) where nothing
//! needs to outlive the process.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryChangeStore
// ---------------------------------------------------------------------------

/// In-memory change store backed by a `HashMap<storage_key, ChangeRecord>`.
///
/// A single mutex guards the map, so `insert_if_absent` and `replace_if_head`
/// are trivially atomic. Contents are lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryChangeStore {
    records: Mutex<HashMap<String, ChangeRecord>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChangeStore for MemoryChangeStore {
    async fn find(&self, key: &ChangeKey) -> StorageResult<Option<ChangeRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(&key.storage_key()).cloned())
    }

    async fn upsert(&self, mut record: ChangeRecord) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        let storage_key = record.key.storage_key();
        record.jobs = records
            .get(&storage_key)
            .map(|existing| existing.jobs.clone())
            .unwrap_or_default();
        records.insert(storage_key, record);
        Ok(())
    }

    async fn insert_if_absent(&self, mut record: ChangeRecord) -> StorageResult<bool> {
        let mut records = self.records.lock().unwrap();
        let storage_key = record.key.storage_key();
        if records.contains_key(&storage_key) {
            return Ok(false);
        }
        record.jobs.clear();
        records.insert(storage_key, record);
        Ok(true)
    }

    async fn replace_if_head(
        &self,
        mut record: ChangeRecord,
        expected_head: &str,
    ) -> StorageResult<bool> {
        let mut records = self.records.lock().unwrap();
        let Some(existing) = records.get_mut(&record.key.storage_key()) else {
            return Ok(false);
        };
        if existing.head != expected_head {
            return Ok(false);
        }
        record.jobs = std::mem::take(&mut existing.jobs);
        *existing = record;
        Ok(true)
    }

    async fn append_job(&self, key: &ChangeKey, job: Job) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&key.storage_key())
            .ok_or_else(|| StorageError::NotFound {
                key: key.storage_key(),
            })?;
        record.jobs.push(job);
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<String>,
    ) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        let job = records
            .values_mut()
            .flat_map(|r| r.jobs.iter_mut())
            .find(|j| &j.id == job_id)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        job.status = status;
        job.result = result;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_reported(
        &self,
        key: &ChangeKey,
        filename: &str,
        line: u32,
    ) -> StorageResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&key.storage_key())
            .ok_or_else(|| StorageError::NotFound {
                key: key.storage_key(),
            })?;
        let file = record
            .files
            .iter_mut()
            .find(|f| f.filename == filename)
            .ok_or_else(|| StorageError::FileNotFound {
                key: key.storage_key(),
                filename: filename.to_string(),
            })?;
        file.reported.insert(line);
        Ok(())
    }

    async fn find_jobs_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> StorageResult<Vec<(ChangeKey, Job)>> {
        let records = self.records.lock().unwrap();
        let mut found: Vec<(ChangeKey, Job)> = records
            .values()
            .flat_map(|r| {
                r.jobs
                    .iter()
                    .filter(|j| statuses.contains(&j.status))
                    .map(|j| (r.key.clone(), j.clone()))
            })
            .collect();
        found.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
        Ok(found)
    }
}
