//! SurrealDB row types for Tripwire
//!
//! Rows flatten [`ChangeKey`] into explicit columns so that the unique
//! `change_key` index and the per-column indexes can be defined on them.
//! Jobs live in their own table and reference their change by `change_key`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{ChangeKey, ChangeRecord, FileRecord, Job, JobId, StorageResult};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

pub(crate) const KIND_PROPOSAL: &str = "proposal";
pub(crate) const KIND_PUSH: &str = "push";

/// Row of the `changes` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// `ChangeKey::storage_key()`, unique
    pub change_key: String,
    /// "proposal" | "push"
    pub kind: String,
    pub repo: String,
    /// Pull request number (proposals only)
    pub number: Option<u64>,
    /// Pushed ref (pushes only)
    pub git_ref: Option<String>,
    /// Pushed head SHA (pushes only)
    pub sha: Option<String>,
    pub head: String,
    pub author: Option<String>,
    /// "open" | "closed" | "merged"
    pub status: String,
    pub ignored: bool,
    pub files: Vec<FileRecord>,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl ChangeRow {
    /// Flatten a record into a row. Jobs are not part of the row.
    pub fn from_record(record: &ChangeRecord) -> Self {
        let (kind, number, git_ref, sha) = match &record.key {
            ChangeKey::Proposal { number, .. } => (KIND_PROPOSAL, Some(*number), None, None),
            ChangeKey::Push { git_ref, sha, .. } => {
                (KIND_PUSH, None, Some(git_ref.clone()), Some(sha.clone()))
            }
        };
        ChangeRow {
            id: None,
            change_key: record.key.storage_key(),
            kind: kind.to_string(),
            repo: record.key.repo().to_string(),
            number,
            git_ref,
            sha,
            head: record.head.clone(),
            author: record.author.clone(),
            status: record.status.as_str().to_string(),
            ignored: record.ignored,
            files: record.files.clone(),
            payload: record.payload.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Rebuild the key from the flattened columns.
    pub fn key(&self) -> StorageResult<ChangeKey> {
        match self.kind.as_str() {
            KIND_PROPOSAL => {
                let number = self.number.ok_or_else(|| {
                    StorageError::Corrupt(format!("{}: proposal without number", self.change_key))
                })?;
                Ok(ChangeKey::proposal(self.repo.clone(), number))
            }
            KIND_PUSH => match (&self.git_ref, &self.sha) {
                (Some(git_ref), Some(sha)) => {
                    Ok(ChangeKey::push(self.repo.clone(), git_ref.clone(), sha.clone()))
                }
                _ => Err(StorageError::Corrupt(format!(
                    "{}: push without ref or sha",
                    self.change_key
                ))),
            },
            other => Err(StorageError::Corrupt(format!("unknown change kind: {other}"))),
        }
    }

    /// Convert back to a record, attaching `jobs`.
    pub fn into_record(self, jobs: Vec<Job>) -> StorageResult<ChangeRecord> {
        Ok(ChangeRecord {
            key: self.key()?,
            head: self.head,
            author: self.author,
            status: self.status.parse()?,
            ignored: self.ignored,
            files: self.files,
            jobs,
            payload: self.payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row of the `jobs` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique job ID (UUID string)
    pub job_id: String,
    /// Owning change, by `change_key`
    pub change_key: String,
    pub backend: String,
    /// "new" | "started" | "success" | "failure"
    pub status: String,
    pub result: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn new(change_key: String, job: &Job) -> Self {
        JobRow {
            id: None,
            job_id: job.id.0.clone(),
            change_key,
            backend: job.backend.clone(),
            status: job.status.as_str().to_string(),
            result: job.result.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }

    pub fn into_job(self) -> StorageResult<Job> {
        Ok(Job {
            id: JobId(self.job_id),
            backend: self.backend,
            status: self.status.parse()?,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::{ChangeStatus, JobStatus, Range};

    #[test]
    fn test_change_row_round_trip_keeps_key() {
        let record = ChangeRecord::new(
            ChangeKey::push("widgets", "refs/heads/main", "deadbeef"),
            "deadbeef",
        )
        .with_author("octo");

        let row = ChangeRow::from_record(&record);
        assert_eq!(row.kind, "push");
        assert_eq!(row.change_key, "push/widgets/refs/heads/main/deadbeef");
        assert!(row.number.is_none());

        let back = row.into_record(vec![]).unwrap();
        assert_eq!(back.key, record.key);
        assert_eq!(back.status, ChangeStatus::Open);
        assert_eq!(back.author.as_deref(), Some("octo"));
    }

    #[test]
    fn test_change_row_serialization_skips_missing_id() {
        let record = ChangeRecord::new(ChangeKey::proposal("widgets", 3), "abc").with_files(vec![
            FileRecord {
                filename: "main.go".into(),
                sha: "blob".into(),
                ranges: vec![Range {
                    start: 1,
                    end: 4,
                    block_length: 5,
                    offset: 0,
                    deletions: vec![2],
                }],
                reported: Default::default(),
            },
        ]);
        let json = serde_json::to_value(ChangeRow::from_record(&record)).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["number"], 3);
        assert_eq!(json["files"][0]["ranges"][0]["block_length"], 5);
    }

    #[test]
    fn test_corrupt_kind_is_rejected() {
        let mut row = ChangeRow::from_record(&ChangeRecord::new(ChangeKey::proposal("r", 1), "h"));
        row.kind = "tag".into();
        assert!(matches!(row.key(), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn test_job_row_round_trip() {
        let job = Job::new("make");
        let row = JobRow::new("proposal/r/1".into(), &job);
        assert_eq!(row.status, "new");
        let back = row.into_job().unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::New);
    }
}
