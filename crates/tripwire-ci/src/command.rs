//! Build backend that runs an external command.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tripwire_core::{BuildPayload, BuildStatus, ChangePayload};
use uuid::Uuid;

use crate::backend::BuildBackend;
use crate::error::{BackendError, RegistryError};

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2048;

/// Runs a configured program for every build.
///
/// The change payload is written to the child's stdin as JSON, and exported
/// as `TRIPWIRE_REPO`, `TRIPWIRE_SHA`, `TRIPWIRE_CHANGE`, `TRIPWIRE_CHANGE_ID`,
/// `TRIPWIRE_TYPE` and `TRIPWIRE_BACKEND`. Exit status 0 reports `success`,
/// any other exit `failure` with the tail of stderr as the message.
///
/// The child is killed if the build future is dropped, so an orchestrator
/// timeout does not leave it running.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    name: String,
    command: Vec<String>,
}

/// Captured result of one command run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

impl CommandBackend {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Result<Self, RegistryError> {
        let name = name.into();
        if command.is_empty() {
            return Err(RegistryError::EmptyCommand(name));
        }
        Ok(Self { name, command })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Run the command for `payload` and capture its output.
    pub async fn run(&self, payload: &ChangePayload) -> Result<CommandOutput, BackendError> {
        let start = Instant::now();
        let input = payload.to_value().map_err(|e| BackendError::InvalidInput {
            backend: self.name.clone(),
            reason: e.to_string(),
        })?;

        let exe = &self.command[0];
        let args = &self.command[1..];

        let mut child = Command::new(exe)
            .args(args)
            .env("TRIPWIRE_BACKEND", &self.name)
            .env("TRIPWIRE_REPO", &payload.repo)
            .env("TRIPWIRE_SHA", payload.sha())
            .env("TRIPWIRE_CHANGE", &payload.change)
            .env("TRIPWIRE_CHANGE_ID", &payload.change_id)
            .env("TRIPWIRE_TYPE", type_name(payload))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Programs that never read stdin close the pipe early.
            if let Err(e) = stdin.write_all(input.to_string().as_bytes()).await {
                debug!(backend = %self.name, error = %e, "stdin not consumed");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        BackendError::Spawn {
            backend: self.name.clone(),
            reason: format!("{}: {e}", self.command[0]),
        }
    }

    fn to_payload(
        &self,
        payload: &ChangePayload,
        output: &CommandOutput,
    ) -> Result<Value, BackendError> {
        let build_id = Uuid::new_v4().to_string();
        let result = if output.success {
            BuildPayload::for_change(&self.name, payload, BuildStatus::Success, build_id)
        } else {
            BuildPayload::for_change(&self.name, payload, BuildStatus::Failure, build_id)
                .with_message(failure_message(output))
        };
        result.to_value().map_err(|source| BackendError::InvalidOutput {
            backend: self.name.clone(),
            source,
        })
    }
}

#[async_trait]
impl BuildBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build_proposal(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        let output = self.run(payload).await?;
        debug!(
            backend = %self.name,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "proposal build finished"
        );
        self.to_payload(payload, &output)
    }

    async fn build_change(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        let output = self.run(payload).await?;
        debug!(
            backend = %self.name,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "change build finished"
        );
        self.to_payload(payload, &output)
    }
}

fn type_name(payload: &ChangePayload) -> &'static str {
    match payload.kind {
        tripwire_core::ChangeType::Proposal => "proposal",
        tripwire_core::ChangeType::Change => "change",
    }
}

fn failure_message(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim_end();
    if stderr.is_empty() {
        return format!("exit code {}", output.exit_code);
    }
    let mut cut = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    while !stderr.is_char_boundary(cut) {
        cut += 1;
    }
    format!("exit code {}: {}", output.exit_code, &stderr[cut..])
}
