//! SurrealDB schema migrations and initialization
//!
//! Sets up the `changes` and `jobs` tables with their unique indexes. The
//! unique index on `changes.change_key` is what makes concurrent
//! insert-if-absent calls resolve to a single winner.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Tripwire tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Tripwire SurrealDB schema");

    init_changes_table(db).await?;
    init_jobs_table(db).await?;

    info!("Tripwire schema initialization complete");
    Ok(())
}

/// Initialize `changes` table
///
/// Schema:
/// ```text
/// TABLE changes {
///   change_key:  STRING (unique)
///   kind:        STRING (proposal | push)
///   repo:        STRING (indexed)
///   number:      INT?
///   git_ref:     STRING?
///   sha:         STRING?
///   head:        STRING
///   author:      STRING?
///   status:      STRING (open | closed | merged)
///   ignored:     BOOL
///   files:       ARRAY<OBJECT>
///   payload:     OBJECT
///   created_at:  DATETIME
///   updated_at:  DATETIME
/// }
/// ```
async fn init_changes_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing changes table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS changes AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        -- One record per pull request and per (repo, ref, sha) push
        DEFINE INDEX IF NOT EXISTS idx_change_key ON TABLE changes COLUMNS change_key UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_repo ON TABLE changes COLUMNS repo;
        DEFINE INDEX IF NOT EXISTS idx_repo_status ON TABLE changes COLUMNS repo, status;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ changes table initialized");
    Ok(())
}

/// Initialize `jobs` table
///
/// Schema:
/// ```text
/// TABLE jobs {
///   job_id:      STRING (unique)
///   change_key:  STRING (indexed, references changes.change_key)
///   backend:     STRING
///   status:      STRING (new | started | success | failure)
///   result:      STRING?
///   created_at:  DATETIME
///   updated_at:  DATETIME
/// }
/// ```
async fn init_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing jobs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS jobs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE jobs COLUMNS job_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_job_change_key ON TABLE jobs COLUMNS change_key;
        DEFINE INDEX IF NOT EXISTS idx_job_status ON TABLE jobs COLUMNS status;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ jobs table initialized");
    Ok(())
}
