//! Tripwire CLI
//!
//! The `tripwire` command drives the change pipeline from files on disk.
//!
//! ## Commands
//!
//! - `ingest`: classify one webhook body and fan out any triggered build
//! - `pending`: list jobs still waiting for a final result
//! - `hunks`: parse a unified-diff patch into hunk ranges
//! - `validate`: check a change or build payload against its schema

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument, Level};

use tripwire_ci::{BackendRegistry, ChannelPublisher, IngestReport, Pipeline};
use tripwire_core::telemetry::init_tracing;
use tripwire_core::{validate, FileDiff, Range, ServiceConfig, BUILD_SCHEMA, CHANGE_SCHEMA};
use tripwire_state::fakes::MemoryChangeStore;
use tripwire_state::{ChangeStore, SurrealChangeStore};

#[derive(Parser)]
#[command(name = "tripwire")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Change-event classification and build fan-out", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on one webhook body and print the report as JSON
    Ingest {
        /// Webhook event name (pull_request, push, issue_comment)
        #[arg(short, long)]
        event: String,

        /// Path to the JSON body
        #[arg(short, long)]
        payload: PathBuf,

        /// Service configuration file
        #[arg(short, long, env = "TRIPWIRE_CONFIG", default_value = "tripwire.toml")]
        config: PathBuf,

        /// Use the in-process store instead of SURREALDB_URL; nothing persists
        #[arg(long)]
        in_memory: bool,
    },

    /// List jobs that are new or started
    Pending,

    /// Print the hunk ranges of a patch file
    Hunks {
        /// Unified-diff patch for one file
        patch: PathBuf,

        /// Translate this diff position into a new-file line
        #[arg(long)]
        position: Option<u32>,
    },

    /// Validate a payload file against a schema
    Validate {
        #[arg(long, value_enum)]
        schema: SchemaKind,

        /// JSON payload file
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SchemaKind {
    Change,
    Build,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Ingest {
            event,
            payload,
            config,
            in_memory,
        } => cmd_ingest(&event, &payload, &config, in_memory).await,
        Commands::Pending => cmd_pending().await,
        Commands::Hunks { patch, position } => cmd_hunks(&patch, position),
        Commands::Validate { schema, file } => cmd_validate(schema, &file),
    }
}

/// Classify one webhook body, build if triggered, print the report
async fn cmd_ingest(event: &str, payload: &Path, config: &Path, in_memory: bool) -> Result<()> {
    let report = run_ingest(event, payload, config, in_memory).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_ingest(
    event: &str,
    payload: &Path,
    config_path: &Path,
    in_memory: bool,
) -> Result<IngestReport> {
    let body = read_json(payload)?;
    let config = ServiceConfig::load(Some(config_path))
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let registry =
        BackendRegistry::from_config(&config).context("Failed to register build backends")?;
    info!(backends = ?registry.names(), "registered build backends");

    let store = open_store(in_memory).await?;

    // The channel rejects publishes without a subscriber.
    let publisher = Arc::new(ChannelPublisher::new(64));
    let mut receiver = publisher.subscribe();

    let pipeline = Pipeline::new(store, registry, publisher, config);
    let report = pipeline
        .ingest_webhook(event, &body)
        .instrument(info_span!("tripwire.ingest", event = %event))
        .await
        .with_context(|| format!("Failed to ingest {event} event"))?;

    let mut delivered = 0usize;
    while let Ok(message) = receiver.try_recv() {
        debug!(topic = %message.topic, backend = %message.payload["backend"], "delivered");
        delivered += 1;
    }
    info!(change = %report.change, outcome = %report.outcome, delivered, "ingest finished");
    Ok(report)
}

async fn open_store(in_memory: bool) -> Result<Arc<dyn ChangeStore>> {
    if in_memory {
        return Ok(Arc::new(MemoryChangeStore::new()));
    }
    let store = SurrealChangeStore::from_env()
        .await
        .context("Failed to connect to the change store")?;
    Ok(Arc::new(store))
}

#[derive(Serialize)]
struct PendingJob {
    change: String,
    job_id: String,
    backend: String,
    status: String,
    created_at: String,
}

/// List jobs without a final result
async fn cmd_pending() -> Result<()> {
    let store = open_store(false).await?;
    let jobs = store
        .find_jobs_by_status(&[tripwire_state::JobStatus::New, tripwire_state::JobStatus::Started])
        .await
        .context("Failed to query pending jobs")?;

    if jobs.is_empty() {
        println!("No pending jobs.");
        return Ok(());
    }
    let rows: Vec<PendingJob> = jobs
        .into_iter()
        .map(|(key, job)| PendingJob {
            change: key.to_string(),
            job_id: job.id.to_string(),
            backend: job.backend,
            status: job.status.to_string(),
            created_at: job.created_at.to_rfc3339(),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct HunkReport {
    filename: String,
    ranges: Vec<Range>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
}

/// Print parsed hunk ranges, optionally translating a diff position
fn cmd_hunks(patch: &Path, position: Option<u32>) -> Result<()> {
    let report = hunk_report(patch, position)?;
    if let (Some(position), None) = (report.position, report.line) {
        println!("Position {position} does not map to a line in the new file.");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn hunk_report(patch: &Path, position: Option<u32>) -> Result<HunkReport> {
    let text = std::fs::read_to_string(patch)
        .with_context(|| format!("Failed to read patch file {}", patch.display()))?;
    let filename = patch
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let diff = FileDiff::from_patch(filename, "", Some(&text));
    let line = position.and_then(|p| diff.line_for_position(p));
    Ok(HunkReport {
        filename: diff.filename,
        ranges: diff.ranges,
        position,
        line,
    })
}

/// Validate a payload file; exits non-zero when it does not conform
fn cmd_validate(schema: SchemaKind, file: &Path) -> Result<()> {
    let payload = read_json(file)?;
    let schema = match schema {
        SchemaKind::Change => &CHANGE_SCHEMA,
        SchemaKind::Build => &BUILD_SCHEMA,
    };
    match validate(payload, schema) {
        Ok(_) => {
            println!("{} is a valid {} payload", file.display(), schema.name);
            Ok(())
        }
        Err(e) => bail!("{}: {e}", file.display()),
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}
