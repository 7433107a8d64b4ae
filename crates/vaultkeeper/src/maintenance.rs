//! Index rebuild, planner statistics and file compaction

use crate::error::StoreError;
use crate::schema::{PerformanceIndex, PERFORMANCE_INDEXES};
use rusqlite::Connection;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReindexResult {
    pub indexes_rebuilt: usize,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn rebuild(conn: &mut Connection, indexes: &[PerformanceIndex]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    for index in indexes {
        tx.execute_batch(&format!("DROP INDEX IF EXISTS {};", index.name))?;
        tx.execute_batch(index.create_sql)?;
    }
    tx.commit()?;
    conn.execute_batch("ANALYZE;")?;
    Ok(indexes.len())
}

/// Drop and recreate the performance indexes in one transaction, then `ANALYZE`.
///
/// Failures are reported in the result rather than returned; the
/// transaction rolls back so the previous indexes stay in place.
pub fn reindex(conn: &mut Connection) -> ReindexResult {
    reindex_with(conn, PERFORMANCE_INDEXES)
}

pub fn reindex_with(conn: &mut Connection, indexes: &[PerformanceIndex]) -> ReindexResult {
    let started = Instant::now();
    let outcome = rebuild(conn, indexes);
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(indexes_rebuilt) => {
            tracing::info!(indexes_rebuilt, duration_ms, "reindex complete");
            ReindexResult {
                indexes_rebuilt,
                duration_ms,
                success: true,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, duration_ms, "reindex failed");
            ReindexResult {
                indexes_rebuilt: 0,
                duration_ms,
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Rewrite the file to reclaim free pages
pub fn vacuum(conn: &Connection) -> Result<(), StoreError> {
    let started = Instant::now();
    conn.execute_batch("VACUUM;")?;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(duration_ms, "vacuum complete");
    Ok(())
}
