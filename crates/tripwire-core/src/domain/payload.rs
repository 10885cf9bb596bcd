//! Typed change and build payloads.
//!
//! Both types are validated against their schema before they are decoded, so
//! a `ChangePayload` or `BuildPayload` value always satisfies it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tripwire_state::ChangeStatus;

use super::error::{Result, SchemaError};
use super::validation::{validate, PayloadSchema, BUILD_SCHEMA, CHANGE_SCHEMA};

/// Whether a change is a proposal (pull request) or a landed change (push).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Proposal,
    Change,
}

/// A change to build.
///
/// For proposals `change` and `change_id` are the pull request number; for
/// pushes `change` is `"<before>...<after>"` and `change_id` is the pushed SHA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub repo: String,
    pub before: String,
    pub after: String,
    /// Who made the change
    pub actor: String,
    pub repo_url: Option<String>,
    /// Base branch (proposals) or pushed ref (pushes)
    pub base_ref: Option<String>,
    pub fork_url: Option<String>,
    /// Fork branch
    pub fork_ref: Option<String>,
    /// `None` for pushes
    pub status: Option<ChangeStatus>,
    /// Hosting-service ID of the repository
    pub repo_id: Option<u64>,
    pub change: String,
    pub change_id: String,
    #[serde(rename = "type")]
    pub kind: ChangeType,
}

impl ChangePayload {
    /// Validate against [`CHANGE_SCHEMA`], then decode.
    pub fn from_value(value: Value) -> Result<Self> {
        decode(value, &CHANGE_SCHEMA)
    }

    /// Encode and validate against [`CHANGE_SCHEMA`].
    pub fn to_value(&self) -> Result<Value> {
        encode(self, &CHANGE_SCHEMA)
    }

    /// The commit a build of this change must test.
    pub fn sha(&self) -> &str {
        &self.after
    }
}

/// Result status reported by a build backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Building,
    Success,
    Failure,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Building => "building",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome a build backend reports for one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPayload {
    pub backend: String,
    pub repo: String,
    pub change: String,
    pub change_id: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub kind: ChangeType,
    pub status: BuildStatus,
    pub build_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BuildPayload {
    /// Start a result for `change` on `backend`, copying its identity fields.
    pub fn for_change(
        backend: impl Into<String>,
        change: &ChangePayload,
        status: BuildStatus,
        build_id: impl Into<String>,
    ) -> Self {
        BuildPayload {
            backend: backend.into(),
            repo: change.repo.clone(),
            change: change.change.clone(),
            change_id: change.change_id.clone(),
            sha: change.after.clone(),
            kind: change.kind,
            status,
            build_id: build_id.into(),
            build_url: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_build_url(mut self, url: impl Into<String>) -> Self {
        self.build_url = Some(url.into());
        self
    }

    /// Validate against [`BUILD_SCHEMA`], then decode.
    pub fn from_value(value: Value) -> Result<Self> {
        decode(value, &BUILD_SCHEMA)
    }

    /// Encode and validate against [`BUILD_SCHEMA`].
    pub fn to_value(&self) -> Result<Value> {
        encode(self, &BUILD_SCHEMA)
    }

    /// `true` when repo, change_id and sha identify `change`.
    pub fn matches(&self, change: &ChangePayload) -> bool {
        self.repo == change.repo && self.change_id == change.change_id && self.sha == change.after
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, schema: &PayloadSchema) -> Result<T> {
    let value = validate(value, schema)?;
    serde_json::from_value(value).map_err(|e| SchemaError::Decode {
        schema: schema.name,
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(payload: &T, schema: &PayloadSchema) -> Result<Value> {
    let value = serde_json::to_value(payload).map_err(|e| SchemaError::Decode {
        schema: schema.name,
        reason: e.to_string(),
    })?;
    validate(value, schema)
}
