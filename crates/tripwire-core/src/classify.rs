//! Event classification and deduplication.
//!
//! [`EventClassifier`] decides, for one normalised [`ChangeEvent`] and the
//! stored state of its change, whether a build must be triggered. It is the
//! only writer of change records outside job bookkeeping. All dedup decisions
//! go through the store's key-scoped operations, so webhook and poll ingress
//! may race on the same change without double-triggering.
//!
//! | event                          | stored state                 | outcome     |
//! |--------------------------------|------------------------------|-------------|
//! | pull request                   | none                         | `new`       |
//! | pull request                   | different head               | `updated`   |
//! | pull request closed            | any                          | `closed` / `merged` |
//! | pull request, `mergeable=false`| any                          | `ignored`   |
//! | pull request, same head        | eligible retest comment      | `retest`    |
//! | push                           | none / present               | `new` / `unchanged` |
//! | issue comment with directive   | known open change            | `retest` / `ignored` / `unchanged` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};
use tripwire_state::{ChangeKey, ChangeRecord, ChangeStatus, ChangeStore, StorageError};

use crate::config::ServiceConfig;
use crate::directive::{has_directive, parse_directive, Directive};
use crate::domain::{ChangePayload, ClassifyError};
use crate::event::{ChangeEvent, CommentEvent, PullRequestAction, PullRequestEvent, PushEvent};
use crate::obs;

/// Classification result for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    New,
    Unchanged,
    Updated,
    Closed,
    Merged,
    Ignored,
    Retest,
}

impl Outcome {
    /// `true` for outcomes that dispatch a build.
    pub fn triggers_build(&self) -> bool {
        matches!(self, Outcome::New | Outcome::Updated | Outcome::Retest)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::New => "new",
            Outcome::Unchanged => "unchanged",
            Outcome::Updated => "updated",
            Outcome::Closed => "closed",
            Outcome::Merged => "merged",
            Outcome::Ignored => "ignored",
            Outcome::Retest => "retest",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the classifier decided, and the state it left behind.
#[derive(Debug, Clone)]
pub struct Classification {
    pub outcome: Outcome,
    pub key: ChangeKey,
    /// Stored record after classification, when one was read or written
    pub record: Option<ChangeRecord>,
    /// Payload to build; set exactly when `outcome.triggers_build()`
    pub payload: Option<ChangePayload>,
}

impl Classification {
    fn skip(outcome: Outcome, key: ChangeKey, record: Option<ChangeRecord>) -> Self {
        Classification {
            outcome,
            key,
            record,
            payload: None,
        }
    }

    fn trigger(
        outcome: Outcome,
        key: ChangeKey,
        record: ChangeRecord,
        payload: ChangePayload,
    ) -> Self {
        Classification {
            outcome,
            key,
            record: Some(record),
            payload: Some(payload),
        }
    }
}

/// Classifies change events against stored change records.
pub struct EventClassifier {
    store: Arc<dyn ChangeStore>,
    config: Arc<ServiceConfig>,
}

impl EventClassifier {
    pub fn new(store: Arc<dyn ChangeStore>, config: Arc<ServiceConfig>) -> Self {
        Self { store, config }
    }

    /// Classify `event`, recording the decision in the store.
    ///
    /// Store failures are returned as [`ClassifyError::Store`]; a failed
    /// lookup is never treated as "no record".
    #[instrument(skip(self, event), fields(kind = event.kind(), change = %event.key()))]
    pub async fn classify(&self, event: &ChangeEvent) -> Result<Classification, ClassifyError> {
        let classification = match event {
            ChangeEvent::PullRequest(pr) => self.classify_pull_request(pr).await?,
            ChangeEvent::Push(push) => self.classify_push(push).await?,
            ChangeEvent::Comment(comment) => self.classify_comment(comment).await?,
        };

        obs::emit_event_classified(
            &classification.key.storage_key(),
            event.kind(),
            classification.outcome.as_str(),
            classification.outcome.triggers_build(),
        );
        Ok(classification)
    }

    // -- pull requests -------------------------------------------------------

    async fn classify_pull_request(
        &self,
        pr: &PullRequestEvent,
    ) -> Result<Classification, ClassifyError> {
        let key = ChangeKey::proposal(pr.repo.clone(), pr.number);

        if let Some(PullRequestAction::Other(action)) = &pr.action {
            debug!(action = %action, "pull request action does not affect builds");
            return Ok(Classification::skip(Outcome::Ignored, key, None));
        }

        let closing = matches!(pr.action, Some(PullRequestAction::Closed))
            || pr.status != ChangeStatus::Open;
        if closing {
            let status = if pr.status == ChangeStatus::Merged {
                ChangeStatus::Merged
            } else {
                ChangeStatus::Closed
            };
            return self.close(key, status).await;
        }

        if pr.mergeable == Some(false) {
            debug!("pull request is not mergeable");
            return Ok(Classification::skip(Outcome::Ignored, key, None));
        }

        let account = &self.config.service_account;
        if let Some(body) = &pr.body {
            if has_directive(body, account, Directive::Ignore) {
                debug!("pull request body asks to be ignored");
                return Ok(Classification::skip(Outcome::Ignored, key, None));
            }
        }

        let record = match self.find(&key).await? {
            Some(record) => record,
            None => {
                let record = self.fresh_record(&key, pr)?;
                if self.insert_if_absent(&key, record.clone()).await? {
                    return Ok(Classification::trigger(
                        Outcome::New,
                        key,
                        record,
                        pr.payload.clone(),
                    ));
                }
                // Another delivery created it first; classify against theirs.
                debug!("lost insert race, re-reading record");
                self.find(&key).await?.ok_or_else(|| {
                    ClassifyError::store(
                        "reread",
                        &key,
                        StorageError::NotFound {
                            key: key.storage_key(),
                        },
                    )
                })?
            }
        };

        if record.ignored {
            return Ok(Classification::skip(Outcome::Ignored, key, Some(record)));
        }

        if record.head != pr.head {
            let mut updated = self.fresh_record(&key, pr)?;
            updated.inherit_reported(&record.files);
            updated.created_at = record.created_at;
            updated.jobs = record.jobs;
            if !self
                .replace_if_head(&key, updated.clone(), &record.head)
                .await?
            {
                debug!("lost head race, re-reading record");
                let current = self.find(&key).await?.ok_or_else(|| {
                    ClassifyError::store(
                        "reread",
                        &key,
                        StorageError::NotFound {
                            key: key.storage_key(),
                        },
                    )
                })?;
                return Ok(Classification::skip(
                    Outcome::Unchanged,
                    key,
                    Some(current),
                ));
            }
            return Ok(Classification::trigger(
                Outcome::Updated,
                key,
                updated,
                pr.payload.clone(),
            ));
        }

        if record.status != pr.status {
            let mut synced = record;
            synced.status = pr.status;
            self.upsert(&key, synced.clone()).await?;
            return Ok(Classification::skip(Outcome::Unchanged, key, Some(synced)));
        }

        self.check_comments(key, record, pr).await
    }

    /// Same head, same status: look for directives in comments newer than the record.
    async fn check_comments(
        &self,
        key: ChangeKey,
        mut record: ChangeRecord,
        pr: &PullRequestEvent,
    ) -> Result<Classification, ClassifyError> {
        let account = &self.config.service_account;
        let mut newest_retest: Option<DateTime<Utc>> = None;
        let mut newest_ignore: Option<DateTime<Utc>> = None;

        for comment in pr
            .comments
            .iter()
            .filter(|c| c.created_at > record.updated_at)
        {
            if !self.may_direct(&record, &comment.author) {
                continue;
            }
            let newest = match parse_directive(&comment.body, account) {
                Some(Directive::Retest) => &mut newest_retest,
                Some(Directive::Ignore) => &mut newest_ignore,
                None => continue,
            };
            *newest = Some(newest.map_or(comment.created_at, |t| t.max(comment.created_at)));
        }

        if let Some(at) = newest_ignore {
            record.ignored = true;
            record.updated_at = at;
            self.upsert(&key, record.clone()).await?;
            return Ok(Classification::skip(Outcome::Ignored, key, Some(record)));
        }

        match newest_retest {
            Some(at) => {
                record.updated_at = at;
                record.payload = self.payload_value(&key, &pr.payload)?;
                self.upsert(&key, record.clone()).await?;
                Ok(Classification::trigger(
                    Outcome::Retest,
                    key,
                    record,
                    pr.payload.clone(),
                ))
            }
            None => Ok(Classification::skip(Outcome::Unchanged, key, Some(record))),
        }
    }

    async fn close(
        &self,
        key: ChangeKey,
        status: ChangeStatus,
    ) -> Result<Classification, ClassifyError> {
        let outcome = if status == ChangeStatus::Merged {
            Outcome::Merged
        } else {
            Outcome::Closed
        };

        let record = match self.find(&key).await? {
            Some(mut record) if record.status != status => {
                record.status = status;
                record.updated_at = Utc::now();
                self.upsert(&key, record.clone()).await?;
                Some(record)
            }
            other => other,
        };
        Ok(Classification::skip(outcome, key, record))
    }

    // -- pushes --------------------------------------------------------------

    async fn classify_push(&self, push: &PushEvent) -> Result<Classification, ClassifyError> {
        let key = ChangeKey::push(push.repo.clone(), push.git_ref.clone(), push.after.clone());
        let record = ChangeRecord::new(key.clone(), push.after.clone())
            .with_author(push.pusher_name.clone())
            .with_payload(self.payload_value(&key, &push.payload)?);

        if self.insert_if_absent(&key, record.clone()).await? {
            return Ok(Classification::trigger(
                Outcome::New,
                key,
                record,
                push.payload.clone(),
            ));
        }

        debug!("push already recorded");
        let existing = self.find(&key).await?;
        Ok(Classification::skip(Outcome::Unchanged, key, existing))
    }

    // -- comments ------------------------------------------------------------

    async fn classify_comment(
        &self,
        comment: &CommentEvent,
    ) -> Result<Classification, ClassifyError> {
        let key = ChangeKey::proposal(comment.repo.clone(), comment.number);

        if !comment.on_pull_request {
            return Ok(Classification::skip(Outcome::Ignored, key, None));
        }
        let Some(directive) = parse_directive(&comment.body, &self.config.service_account) else {
            return Ok(Classification::skip(Outcome::Ignored, key, None));
        };
        let Some(mut record) = self.find(&key).await? else {
            debug!("directive on an unknown change");
            return Ok(Classification::skip(Outcome::Ignored, key, None));
        };
        if record.ignored || record.status != ChangeStatus::Open {
            return Ok(Classification::skip(Outcome::Ignored, key, Some(record)));
        }
        if !self.may_direct(&record, &comment.author) {
            debug!(author = %comment.author, "directive from unauthorized actor");
            return Ok(Classification::skip(Outcome::Unchanged, key, Some(record)));
        }
        if comment.created_at <= record.updated_at {
            debug!("directive predates last record update");
            return Ok(Classification::skip(Outcome::Unchanged, key, Some(record)));
        }

        record.updated_at = comment.created_at;
        match directive {
            Directive::Ignore => {
                record.ignored = true;
                self.upsert(&key, record.clone()).await?;
                Ok(Classification::skip(Outcome::Ignored, key, Some(record)))
            }
            Directive::Retest => {
                let payload = ChangePayload::from_value(record.payload.clone()).map_err(
                    |source| ClassifyError::Schema {
                        key: key.storage_key(),
                        source,
                    },
                )?;
                self.upsert(&key, record.clone()).await?;
                Ok(Classification::trigger(Outcome::Retest, key, record, payload))
            }
        }
    }

    // -- helpers -------------------------------------------------------------

    /// The change author and allow-listed actors may direct the service account.
    fn may_direct(&self, record: &ChangeRecord, actor: &str) -> bool {
        record
            .author
            .as_deref()
            .is_some_and(|author| author.eq_ignore_ascii_case(actor))
            || self.config.is_allowlisted(actor)
    }

    fn fresh_record(
        &self,
        key: &ChangeKey,
        pr: &PullRequestEvent,
    ) -> Result<ChangeRecord, ClassifyError> {
        let files = pr
            .files
            .iter()
            .map(|f| f.to_diff().into_file_record())
            .collect();
        let mut record = ChangeRecord::new(key.clone(), pr.head.clone())
            .with_author(pr.author.clone())
            .with_files(files)
            .with_payload(self.payload_value(key, &pr.payload)?);
        record.status = pr.status;
        Ok(record)
    }

    fn payload_value(
        &self,
        key: &ChangeKey,
        payload: &ChangePayload,
    ) -> Result<serde_json::Value, ClassifyError> {
        payload.to_value().map_err(|source| ClassifyError::Schema {
            key: key.storage_key(),
            source,
        })
    }

    async fn find(&self, key: &ChangeKey) -> Result<Option<ChangeRecord>, ClassifyError> {
        self.store
            .find(key)
            .await
            .map_err(|e| ClassifyError::store("find", key, e))
    }

    async fn upsert(&self, key: &ChangeKey, record: ChangeRecord) -> Result<(), ClassifyError> {
        self.store
            .upsert(record)
            .await
            .map_err(|e| ClassifyError::store("upsert", key, e))
    }

    async fn replace_if_head(
        &self,
        key: &ChangeKey,
        record: ChangeRecord,
        expected_head: &str,
    ) -> Result<bool, ClassifyError> {
        self.store
            .replace_if_head(record, expected_head)
            .await
            .map_err(|e| ClassifyError::store("replace", key, e))
    }

    async fn insert_if_absent(
        &self,
        key: &ChangeKey,
        record: ChangeRecord,
    ) -> Result<bool, ClassifyError> {
        self.store
            .insert_if_absent(record)
            .await
            .map_err(|e| ClassifyError::store("insert", key, e))
    }
}
