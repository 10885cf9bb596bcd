//! Storage trait definitions for Tripwire
//!
//! `ChangeStore` is the persistence contract the classifier and orchestrator
//! depend on. Records are keyed either by pull request
//! (`repo`, `number`) or by push (`repo`, `ref`, `sha`).
//!
//! All operations are async and backend-agnostic. An in-memory fake is
//! provided for testing via the `fakes` module.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Identity of a change record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKey {
    /// A pull request, keyed by repository and pull request number
    Proposal { repo: String, number: u64 },
    /// A push, keyed by repository, ref and the pushed head SHA
    Push {
        repo: String,
        git_ref: String,
        sha: String,
    },
}

impl ChangeKey {
    pub fn proposal(repo: impl Into<String>, number: u64) -> Self {
        ChangeKey::Proposal {
            repo: repo.into(),
            number,
        }
    }

    pub fn push(repo: impl Into<String>, git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        ChangeKey::Push {
            repo: repo.into(),
            git_ref: git_ref.into(),
            sha: sha.into(),
        }
    }

    /// Repository name this key belongs to.
    pub fn repo(&self) -> &str {
        match self {
            ChangeKey::Proposal { repo, .. } | ChangeKey::Push { repo, .. } => repo,
        }
    }

    /// Stable string form used as the unique storage key.
    pub fn storage_key(&self) -> String {
        match self {
            ChangeKey::Proposal { repo, number } => format!("proposal/{repo}/{number}"),
            ChangeKey::Push { repo, git_ref, sha } => format!("push/{repo}/{git_ref}/{sha}"),
        }
    }
}

impl std::fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKey::Proposal { repo, number } => write!(f, "{repo}#{number}"),
            ChangeKey::Push { repo, git_ref, sha } => {
                let short = sha.char_indices().nth(12).map_or(sha.as_str(), |(i, _)| &sha[..i]);
                write!(f, "{repo}@{git_ref}:{short}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Lifecycle status of a change on the hosting service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Open,
    Closed,
    Merged,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Open => "open",
            ChangeStatus::Closed => "closed",
            ChangeStatus::Merged => "merged",
        }
    }
}

impl std::str::FromStr for ChangeStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(ChangeStatus::Open),
            "closed" => Ok(ChangeStatus::Closed),
            "merged" => Ok(ChangeStatus::Merged),
            other => Err(StorageError::Corrupt(format!("unknown change status: {other}"))),
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hunk of a file's patch, in new-file coordinates.
///
/// `offset` is the sum of `block_length` over all earlier hunks of the same
/// file; `deletions` holds the new-file line counter at each removed line, in
/// patch order (a counter repeats when consecutive lines are removed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// First new-file line of the hunk
    pub start: u32,
    /// `start + length` from the hunk header
    pub end: u32,
    /// Diff positions consumed: header + new lines + removed lines
    pub block_length: u32,
    /// Running total of earlier hunks' `block_length`
    pub offset: u32,
    /// New-file line counter at each removed line
    pub deletions: Vec<u32>,
}

/// Per-file state carried on a pull request record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    /// Blob SHA of the file at the head commit
    pub sha: String,
    pub ranges: Vec<Range>,
    /// Lines that already received an inline report
    #[serde(default)]
    pub reported: BTreeSet<u32>,
}

/// Unique identifier for a triggered build job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a build job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Started,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Started => "started",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
        }
    }

    /// `true` once the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "started" => Ok(JobStatus::Started),
            "success" => Ok(JobStatus::Success),
            "failure" => Ok(JobStatus::Failure),
            other => Err(StorageError::Corrupt(format!("unknown job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build triggered for a change on one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Build backend the job was dispatched to
    pub backend: String,
    pub status: JobStatus,
    /// Free-form outcome (build status or error text)
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job in `new` state.
    pub fn new(backend: impl Into<String>) -> Self {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            backend: backend.into(),
            status: JobStatus::New,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persisted state of one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: ChangeKey,
    /// Last head SHA seen for the change
    pub head: String,
    /// Login of the change author (pull requests) or pusher name
    pub author: Option<String>,
    pub status: ChangeStatus,
    /// Set by an ignore directive; suppresses all later triggers
    pub ignored: bool,
    pub files: Vec<FileRecord>,
    /// Jobs in trigger order. Only `append_job`/`update_job_status` change these.
    pub jobs: Vec<Job>,
    /// Change payload of the most recent trigger
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Last time the record was refreshed; comments older than this are stale
    pub updated_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Create an open record for `key` at `head`.
    pub fn new(key: ChangeKey, head: impl Into<String>) -> Self {
        let now = Utc::now();
        ChangeRecord {
            key,
            head: head.into(),
            author: None,
            status: ChangeStatus::Open,
            ignored: false,
            files: Vec::new(),
            jobs: Vec::new(),
            payload: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_files(mut self, files: Vec<FileRecord>) -> Self {
        self.files = files;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Look up a tracked file by name.
    pub fn file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.filename == filename)
    }

    /// Copy reported-line sets from `previous` onto files with the same name.
    ///
    /// Matching is by filename only; a renamed file starts with an empty set.
    pub fn inherit_reported(&mut self, previous: &[FileRecord]) {
        for file in &mut self.files {
            if let Some(old) = previous.iter().find(|p| p.filename == file.filename) {
                file.reported.extend(old.reported.iter().copied());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeStore
// ---------------------------------------------------------------------------

/// Change record store.
///
/// Guarantees:
/// - Read-your-write consistency for a single key.
/// - `insert_if_absent` is atomic: of any number of concurrent calls for the
///   same key, exactly one returns `true`.
/// - `replace_if_head` is an atomic compare-and-swap on the stored head.
/// - `jobs` on a record passed to `upsert`/`insert_if_absent` are ignored;
///   jobs change only through `append_job` and `update_job_status`.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Fetch the record for `key`, if any.
    async fn find(&self, key: &ChangeKey) -> StorageResult<Option<ChangeRecord>>;

    /// Insert or replace the record stored under `record.key`.
    async fn upsert(&self, record: ChangeRecord) -> StorageResult<()>;

    /// Insert the record only if nothing is stored under its key.
    ///
    /// Returns `true` if this call inserted it.
    async fn insert_if_absent(&self, record: ChangeRecord) -> StorageResult<bool>;

    /// Replace the stored record only while its head is still `expected_head`.
    ///
    /// Returns `false` if the record is missing or another writer moved its
    /// head first. Of concurrent calls expecting the same head, at most one
    /// returns `true`.
    async fn replace_if_head(
        &self,
        record: ChangeRecord,
        expected_head: &str,
    ) -> StorageResult<bool>;

    /// Append a job to the record. Fails with `NotFound` if the record is missing.
    async fn append_job(&self, key: &ChangeKey, job: Job) -> StorageResult<()>;

    /// Set status and result of a job, wherever it is stored.
    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<String>,
    ) -> StorageResult<()>;

    /// Record that `line` of `filename` has been reported on.
    async fn mark_reported(&self, key: &ChangeKey, filename: &str, line: u32)
        -> StorageResult<()>;

    /// All jobs currently in one of `statuses`, with the key of their record.
    async fn find_jobs_by_status(
        &self,
        statuses: &[JobStatus],
    ) -> StorageResult<Vec<(ChangeKey, Job)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, reported: &[u32]) -> FileRecord {
        FileRecord {
            filename: name.to_string(),
            sha: "blob".to_string(),
            ranges: vec![],
            reported: reported.iter().copied().collect(),
        }
    }

    #[test]
    fn test_storage_key_distinguishes_kinds() {
        let pr = ChangeKey::proposal("widgets", 12);
        let push = ChangeKey::push("widgets", "refs/heads/main", "abc123");
        assert_eq!(pr.storage_key(), "proposal/widgets/12");
        assert_eq!(push.storage_key(), "push/widgets/refs/heads/main/abc123");
        assert_eq!(pr.repo(), "widgets");
    }

    #[test]
    fn test_key_display_shortens_sha() {
        let push = ChangeKey::push("widgets", "refs/heads/main", "0123456789abcdef0123");
        assert_eq!(push.to_string(), "widgets@refs/heads/main:0123456789ab");
        assert_eq!(ChangeKey::proposal("widgets", 7).to_string(), "widgets#7");
    }

    #[test]
    fn test_key_display_handles_multibyte_sha() {
        let push = ChangeKey::push("widgets", "refs/heads/main", "aaaaaaaaaaaé-bad");
        assert_eq!(push.to_string(), "widgets@refs/heads/main:aaaaaaaaaaaé");

        let short = ChangeKey::push("widgets", "refs/heads/main", "é");
        assert_eq!(short.to_string(), "widgets@refs/heads/main:é");
    }

    #[test]
    fn test_inherit_reported_matches_by_filename() {
        let mut record = ChangeRecord::new(ChangeKey::proposal("r", 1), "new-head")
            .with_files(vec![file("a.go", &[]), file("b.go", &[1])]);
        record.inherit_reported(&[file("a.go", &[4, 7]), file("old_name.go", &[3])]);

        assert_eq!(
            record.file("a.go").unwrap().reported,
            [4, 7].into_iter().collect::<BTreeSet<u32>>()
        );
        assert_eq!(
            record.file("b.go").unwrap().reported,
            [1].into_iter().collect::<BTreeSet<u32>>()
        );
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [JobStatus::New, JobStatus::Started, JobStatus::Success, JobStatus::Failure] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("building".parse::<JobStatus>().is_err());
        assert_eq!("merged".parse::<ChangeStatus>().unwrap(), ChangeStatus::Merged);
    }

    #[test]
    fn test_job_starts_new() {
        let job = Job::new("make");
        assert_eq!(job.status, JobStatus::New);
        assert!(!job.status.is_terminal());
        assert!(job.result.is_none());
    }
}
