//! Baseline schema plus versioned migrations, one transaction per version

use crate::backup::{prune_snapshots, snapshot_before_migration};
use crate::error::{Advisory, StoreError};
use crate::schema::{table_exists, SchemaDefinition};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CREATE_SCHEMA_VERSION_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    /// `None` when the version table has never been written
    pub current_version: Option<i64>,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from_version: Option<i64>,
    pub to_version: i64,
    pub applied: Vec<i64>,
    pub snapshot: Advisory,
    pub pruned: Advisory,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// Stored schema version, if the version table exists and holds its row
pub fn current_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    if !table_exists(conn, "schema_version")? {
        return Ok(None);
    }
    let version = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    Ok(version)
}

fn write_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
        params![version, now_rfc3339()],
    )?;
    Ok(())
}

fn check_not_too_new(stored: Option<i64>, schema: &SchemaDefinition) -> Result<(), StoreError> {
    let supported = schema.latest_version();
    match stored {
        Some(stored) if stored > supported => Err(StoreError::SchemaTooNew { stored, supported }),
        _ => Ok(()),
    }
}

pub fn schema_status(conn: &Connection, schema: &SchemaDefinition) -> Result<SchemaStatus, StoreError> {
    let current_version = current_version(conn)?;
    let floor = current_version.unwrap_or(i64::MIN);
    let pending_versions = schema
        .ordered_migrations()
        .iter()
        .map(|m| m.version)
        .filter(|v| *v > floor)
        .collect();
    Ok(SchemaStatus {
        current_version,
        target_version: schema.latest_version(),
        pending_versions,
    })
}

/// Bring the open store up to the newest version `schema` knows.
///
/// Snapshot and retention are housekeeping and never fail the run; their
/// outcomes come back in the report.
///
/// # Errors
/// Returns [`StoreError::Migration`] when the baseline or a descriptor fails.
/// The store is then left at the last committed version and the next run
/// retries the failed descriptor from scratch.
pub fn run_migrations(
    conn: &mut Connection,
    store_path: &Path,
    schema: &SchemaDefinition,
    retention: usize,
) -> Result<MigrationReport, StoreError> {
    schema.validate()?;
    let from_version = current_version(conn)?;
    check_not_too_new(from_version, schema)?;

    let snapshot = snapshot_before_migration(conn, store_path).log("pre-migration snapshot");

    conn.execute_batch(schema.baseline_sql)
        .map_err(|e| StoreError::Migration {
            version: schema.baseline_version,
            description: "baseline schema".into(),
            reason: e.to_string(),
        })?;

    conn.execute_batch(CREATE_SCHEMA_VERSION_SQL)?;
    let mut version = match current_version(conn)? {
        Some(version) => version,
        None => {
            write_version(conn, schema.baseline_version)?;
            tracing::info!(version = schema.baseline_version, "schema version seeded at baseline");
            schema.baseline_version
        }
    };

    let mut applied = Vec::new();
    let start = version;
    for migration in schema.ordered_migrations().into_iter().filter(|m| m.version > start) {
        tracing::info!(
            from = version,
            to = migration.version,
            description = migration.description,
            "applying migration"
        );
        let fail = |e: rusqlite::Error| StoreError::Migration {
            version: migration.version,
            description: migration.description.to_string(),
            reason: e.to_string(),
        };

        let tx = conn.transaction().map_err(fail)?;
        (migration.apply)(&tx).map_err(fail)?;
        write_version(&tx, migration.version).map_err(fail)?;
        tx.commit().map_err(fail)?;

        tracing::info!(version = migration.version, "migration committed");
        version = migration.version;
        applied.push(migration.version);
    }

    if version < schema.baseline_version {
        tracing::warn!(version, baseline = schema.baseline_version, "stored version below baseline, raising");
        write_version(conn, schema.baseline_version)?;
        version = schema.baseline_version;
    }

    let pruned = prune_snapshots(store_path, retention).log("snapshot retention");

    Ok(MigrationReport {
        from_version,
        to_version: version,
        applied,
        snapshot,
        pruned,
    })
}
