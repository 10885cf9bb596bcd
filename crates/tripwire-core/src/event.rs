//! Inbound change events.
//!
//! Normalises a hosting-service delivery `(event name, JSON body)` into a
//! [`ChangeEvent`]. Webhook deliveries and poll clients hand over the same
//! shapes; a polled pull request simply has no `action` and may carry the
//! changed files and review comments alongside it:
//!
//! ```json
//! { "pull_request": { ... }, "repository": { ... },
//!   "files": [{ "filename": "a.go", "sha": "...", "patch": "@@ ..." }],
//!   "comments": [{ "user": { "login": "octo" }, "body": "...", "created_at": "..." }] }
//! ```
//!
//! Required fields are checked here, so a malformed event is rejected with a
//! [`ClassificationError`] before anything consults the store.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tripwire_state::{ChangeKey, ChangeStatus};

use crate::diff::FileDiff;
use crate::domain::{ChangePayload, ChangeType, ClassificationError};

/// Pull request action as delivered by the hosting service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Closed,
    Other(String),
}

impl PullRequestAction {
    fn parse(action: &str) -> Self {
        match action {
            "opened" => PullRequestAction::Opened,
            "synchronize" => PullRequestAction::Synchronize,
            "closed" => PullRequestAction::Closed,
            other => PullRequestAction::Other(other.to_string()),
        }
    }
}

/// A file changed by a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub filename: String,
    pub sha: String,
    /// Absent for binary or oversized files
    pub patch: Option<String>,
}

impl ChangedFile {
    pub fn to_diff(&self) -> FileDiff {
        FileDiff::from_patch(&self.filename, &self.sha, self.patch.as_deref())
    }
}

/// A comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestEvent {
    pub repo: String,
    pub number: u64,
    /// `None` for polled pull requests
    pub action: Option<PullRequestAction>,
    pub head: String,
    pub author: String,
    pub body: Option<String>,
    /// `Some(false)` when the hosting service reports a merge conflict
    pub mergeable: Option<bool>,
    pub status: ChangeStatus,
    pub files: Vec<ChangedFile>,
    pub comments: Vec<ReviewComment>,
    pub payload: ChangePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub repo: String,
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub pusher_name: String,
    pub pusher_email: String,
    pub payload: ChangePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEvent {
    pub repo: String,
    /// Issue or pull request number
    pub number: u64,
    /// `false` for comments on plain issues
    pub on_pull_request: bool,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A normalised hosting-service event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    PullRequest(PullRequestEvent),
    Push(PushEvent),
    Comment(CommentEvent),
}

impl ChangeEvent {
    /// Normalise a delivery named `event` (`pull_request`, `push`, `issue_comment`).
    pub fn from_webhook(event: &str, body: &Value) -> Result<Self, ClassificationError> {
        match event {
            "pull_request" => parse_pull_request(body).map(ChangeEvent::PullRequest),
            "push" => parse_push(body).map(ChangeEvent::Push),
            "issue_comment" => parse_comment(body).map(ChangeEvent::Comment),
            other => Err(ClassificationError::UnsupportedEvent(other.to_string())),
        }
    }

    /// Store key of the change this event concerns.
    pub fn key(&self) -> ChangeKey {
        match self {
            ChangeEvent::PullRequest(pr) => ChangeKey::proposal(pr.repo.clone(), pr.number),
            ChangeEvent::Push(push) => {
                ChangeKey::push(push.repo.clone(), push.git_ref.clone(), push.after.clone())
            }
            ChangeEvent::Comment(c) => ChangeKey::proposal(c.repo.clone(), c.number),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::PullRequest(_) => "pull_request",
            ChangeEvent::Push(_) => "push",
            ChangeEvent::Comment(_) => "issue_comment",
        }
    }
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

struct Fields<'a> {
    event: &'static str,
    body: &'a Value,
}

impl<'a> Fields<'a> {
    fn missing(&self, field: &str) -> ClassificationError {
        ClassificationError::MissingField {
            event: self.event.to_string(),
            field: field.trim_start_matches('/').replace('/', "."),
        }
    }

    fn malformed(&self, field: &str, reason: impl Into<String>) -> ClassificationError {
        ClassificationError::Malformed {
            event: self.event.to_string(),
            field: field.trim_start_matches('/').replace('/', "."),
            reason: reason.into(),
        }
    }

    fn opt_str(&self, pointer: &str) -> Option<&'a str> {
        self.body.pointer(pointer).and_then(Value::as_str)
    }

    /// Required non-empty string.
    fn str(&self, pointer: &str) -> Result<&'a str, ClassificationError> {
        self.opt_str(pointer)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.missing(pointer))
    }

    fn opt_u64(&self, pointer: &str) -> Option<u64> {
        self.body.pointer(pointer).and_then(Value::as_u64)
    }

    fn u64(&self, pointer: &str) -> Result<u64, ClassificationError> {
        match self.body.pointer(pointer) {
            None | Some(Value::Null) => Err(self.missing(pointer)),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| self.malformed(pointer, format!("expected a number, got {v}"))),
        }
    }

    fn opt_bool(&self, pointer: &str) -> Option<bool> {
        self.body.pointer(pointer).and_then(Value::as_bool)
    }

    fn timestamp(&self, pointer: &str) -> Result<DateTime<Utc>, ClassificationError> {
        let raw = self.str(pointer)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.malformed(pointer, e.to_string()))
    }

    fn array(&self, pointer: &str) -> &'a [Value] {
        self.body
            .pointer(pointer)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn nested(&self, body: &'a Value) -> Fields<'a> {
        Fields {
            event: self.event,
            body,
        }
    }
}

fn repo_url(fields: &Fields<'_>) -> Option<String> {
    fields
        .opt_str("/repository/clone_url")
        .or_else(|| fields.opt_str("/repository/url"))
        .map(str::to_string)
}

fn to_payload(event: &str, payload: ChangePayload) -> Result<ChangePayload, ClassificationError> {
    // Round-trip through the schema so a payload that left this module is valid.
    payload
        .to_value()
        .and_then(ChangePayload::from_value)
        .map_err(|source| ClassificationError::Payload {
            event: event.to_string(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn parse_pull_request(body: &Value) -> Result<PullRequestEvent, ClassificationError> {
    let f = Fields {
        event: "pull_request",
        body,
    };

    let repo = f.str("/repository/name")?.to_string();
    let number = match f.opt_u64("/pull_request/number") {
        Some(n) => n,
        None => f.u64("/number")?,
    };
    let head = f.str("/pull_request/head/sha")?.to_string();
    let author = f.str("/pull_request/user/login")?.to_string();
    let action = f.opt_str("/action").map(PullRequestAction::parse);

    let status = match (f.opt_str("/pull_request/state"), f.opt_bool("/pull_request/merged")) {
        (_, Some(true)) => ChangeStatus::Merged,
        (Some("closed"), _) => ChangeStatus::Closed,
        _ => ChangeStatus::Open,
    };

    // `head.label` is "owner:branch"; fall back to `head.ref`.
    let fork_ref = f
        .opt_str("/pull_request/head/label")
        .and_then(|label| label.split_once(':').map(|(_, branch)| branch))
        .or_else(|| f.opt_str("/pull_request/head/ref"))
        .map(str::to_string);

    let payload = to_payload(
        f.event,
        ChangePayload {
            repo: repo.clone(),
            before: f.opt_str("/pull_request/base/sha").unwrap_or_default().to_string(),
            after: head.clone(),
            actor: author.clone(),
            repo_url: repo_url(&f),
            base_ref: f.opt_str("/pull_request/base/ref").map(str::to_string),
            fork_url: f
                .opt_str("/pull_request/head/repo/clone_url")
                .map(str::to_string),
            fork_ref,
            status: Some(status),
            repo_id: f.opt_u64("/repository/id"),
            change: number.to_string(),
            change_id: number.to_string(),
            kind: ChangeType::Proposal,
        },
    )?;

    let files = f
        .array("/files")
        .iter()
        .map(|file| {
            let ff = f.nested(file);
            Ok(ChangedFile {
                filename: ff.str("/filename")?.to_string(),
                sha: ff.opt_str("/sha").unwrap_or_default().to_string(),
                patch: ff.opt_str("/patch").map(str::to_string),
            })
        })
        .collect::<Result<Vec<_>, ClassificationError>>()?;

    let comments = f
        .array("/comments")
        .iter()
        .map(|comment| {
            let cf = f.nested(comment);
            Ok(ReviewComment {
                author: cf.str("/user/login")?.to_string(),
                body: cf.opt_str("/body").unwrap_or_default().to_string(),
                created_at: cf.timestamp("/created_at")?,
            })
        })
        .collect::<Result<Vec<_>, ClassificationError>>()?;

    Ok(PullRequestEvent {
        repo,
        number,
        action,
        head,
        author,
        body: f.opt_str("/pull_request/body").map(str::to_string),
        mergeable: f.opt_bool("/pull_request/mergeable"),
        status,
        files,
        comments,
        payload,
    })
}

fn parse_push(body: &Value) -> Result<PushEvent, ClassificationError> {
    let f = Fields {
        event: "push",
        body,
    };

    let repo = f.str("/repository/name")?.to_string();
    let git_ref = f.str("/ref")?.to_string();
    let before = f.str("/before")?.to_string();
    let after = f.str("/after")?.to_string();
    let pusher_name = f.str("/pusher/name")?.to_string();
    let pusher_email = f.str("/pusher/email")?.to_string();

    let payload = to_payload(
        f.event,
        ChangePayload {
            repo: repo.clone(),
            before: before.clone(),
            after: after.clone(),
            actor: pusher_name.clone(),
            repo_url: repo_url(&f),
            base_ref: Some(git_ref.clone()),
            fork_url: None,
            fork_ref: None,
            status: None,
            repo_id: f.opt_u64("/repository/id"),
            change: format!("{before}...{after}"),
            change_id: after.clone(),
            kind: ChangeType::Change,
        },
    )?;

    Ok(PushEvent {
        repo,
        git_ref,
        before,
        after,
        pusher_name,
        pusher_email,
        payload,
    })
}

fn parse_comment(body: &Value) -> Result<CommentEvent, ClassificationError> {
    let f = Fields {
        event: "issue_comment",
        body,
    };

    let created_at = match f.opt_str("/comment/created_at") {
        Some(_) => f.timestamp("/comment/created_at")?,
        None => Utc::now(),
    };

    Ok(CommentEvent {
        repo: f.str("/repository/name")?.to_string(),
        number: f.u64("/issue/number")?,
        on_pull_request: matches!(
            body.pointer("/issue/pull_request"),
            Some(v) if !v.is_null()
        ),
        author: f.str("/comment/user/login")?.to_string(),
        body: f.opt_str("/comment/body").unwrap_or_default().to_string(),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pr_body() -> Value {
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
                "head": {
                    "sha": "abc123",
                    "label": "octo:feature",
                    "ref": "feature",
                    "repo": { "clone_url": "https://github.com/octo/widgets.git" }
                },
                "base": { "sha": "base000", "ref": "main" }
            },
            "repository": {
                "id": 567,
                "name": "widgets",
                "clone_url": "https://github.com/acme/widgets.git"
            }
        })
    }

    #[test]
    fn test_pull_request_identity() {
        let ChangeEvent::PullRequest(pr) = ChangeEvent::from_webhook("pull_request", &pr_body()).unwrap()
        else {
            panic!("expected pull request");
        };
        assert_eq!(pr.action, Some(PullRequestAction::Opened));
        assert_eq!(pr.payload.change_id, "16");
        assert_eq!(pr.payload.before, "base000");
        assert_eq!(pr.payload.after, "abc123");
        assert_eq!(pr.payload.fork_ref.as_deref(), Some("feature"));
        assert_eq!(
            pr.payload.fork_url.as_deref(),
            Some("https://github.com/octo/widgets.git")
        );
        assert_eq!(pr.payload.repo_id, Some(567));
        assert_eq!(pr.payload.kind, ChangeType::Proposal);
    }

    #[test]
    fn test_pull_request_missing_head_rejected() {
        let mut body = pr_body();
        body["pull_request"]["head"]
            .as_object_mut()
            .unwrap()
            .remove("sha");
        let err = ChangeEvent::from_webhook("pull_request", &body).unwrap_err();
        assert!(
            matches!(err, ClassificationError::MissingField { ref field, .. } if field == "pull_request.head.sha")
        );
    }

    #[test]
    fn test_merged_pull_request_status() {
        let mut body = pr_body();
        body["action"] = json!("closed");
        body["pull_request"]["state"] = json!("closed");
        body["pull_request"]["merged"] = json!(true);
        let ChangeEvent::PullRequest(pr) = ChangeEvent::from_webhook("pull_request", &body).unwrap()
        else {
            panic!("expected pull request");
        };
        assert_eq!(pr.status, ChangeStatus::Merged);
        assert_eq!(pr.payload.status, Some(ChangeStatus::Merged));
    }

    #[test]
    fn test_polled_pull_request_with_files_and_comments() {
        let mut body = pr_body();
        body.as_object_mut().unwrap().remove("action");
        body["files"] = json!([{ "filename": "a.go", "sha": "f1", "patch": "@@ -1 +1 @@\n+x" }]);
        body["comments"] = json!([{
            "user": { "login": "alice" },
            "body": "@tripwire retest",
            "created_at": "2024-03-01T10:00:00Z"
        }]);

        let ChangeEvent::PullRequest(pr) = ChangeEvent::from_webhook("pull_request", &body).unwrap()
        else {
            panic!("expected pull request");
        };
        assert!(pr.action.is_none());
        assert_eq!(pr.files[0].to_diff().ranges.len(), 1);
        assert_eq!(pr.comments[0].author, "alice");
    }

    #[test]
    fn test_bad_comment_timestamp_is_malformed() {
        let mut body = pr_body();
        body["comments"] = json!([{
            "user": { "login": "alice" },
            "body": "hi",
            "created_at": "yesterday"
        }]);
        let err = ChangeEvent::from_webhook("pull_request", &body).unwrap_err();
        assert!(matches!(err, ClassificationError::Malformed { .. }));
    }

    #[test]
    fn test_push_requires_pusher_email() {
        let body = json!({
            "ref": "refs/heads/main",
            "before": "aaa",
            "after": "bbb",
            "repository": { "name": "widgets" },
            "pusher": { "name": "octo" }
        });
        let err = ChangeEvent::from_webhook("push", &body).unwrap_err();
        assert!(
            matches!(err, ClassificationError::MissingField { ref field, .. } if field == "pusher.email")
        );
    }

    #[test]
    fn test_push_identity() {
        let body = json!({
            "ref": "refs/heads/main",
            "before": "aaa",
            "after": "bbb",
            "repository": { "name": "widgets", "id": 567 },
            "pusher": { "name": "octo", "email": "octo@example.com" }
        });
        let event = ChangeEvent::from_webhook("push", &body).unwrap();
        assert_eq!(event.key(), ChangeKey::push("widgets", "refs/heads/main", "bbb"));
        let ChangeEvent::Push(push) = event else {
            panic!("expected push");
        };
        assert_eq!(push.payload.change, "aaa...bbb");
        assert_eq!(push.payload.change_id, "bbb");
        assert!(push.payload.status.is_none());
        assert!(push.payload.fork_url.is_none());
    }

    #[test]
    fn test_comment_on_plain_issue() {
        let body = json!({
            "repository": { "name": "widgets" },
            "issue": { "number": 3 },
            "comment": { "user": { "login": "octo" }, "body": "@tripwire retest" }
        });
        let ChangeEvent::Comment(c) = ChangeEvent::from_webhook("issue_comment", &body).unwrap()
        else {
            panic!("expected comment");
        };
        assert!(!c.on_pull_request);
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = ChangeEvent::from_webhook("release", &json!({})).unwrap_err();
        assert!(matches!(err, ClassificationError::UnsupportedEvent(ref e) if e == "release"));
    }
}
