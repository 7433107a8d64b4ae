//! Pre-migration snapshots and their retention
//!
//! Snapshots are byte copies of the (encrypted) store file named
//! `<stem>-backup-<YYYYMMDDTHHMMSSffffff>Z.db` in the store's directory, so
//! sorting names sorts them chronologically. Both operations are
//! housekeeping and answer with an [`Advisory`].

use crate::error::Advisory;
use crate::security::{set_secure_permissions, FILE_PERMISSIONS};
use rusqlite::Connection;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

const SNAPSHOT_MARKER: &str = "-backup-";
const SNAPSHOT_EXTENSION: &str = ".db";
/// `YYYYMMDDTHHMMSSffffffZ`
const TIMESTAMP_LEN: usize = 22;

fn store_stem(store_path: &Path) -> String {
    store_path
        .file_stem()
        .map_or_else(|| "store".to_string(), |s| s.to_string_lossy().into_owned())
}

/// Snapshot file name for a store stem at a given instant
pub fn snapshot_file_name(stem: &str, at: OffsetDateTime) -> String {
    let format = format_description!(
        "[year][month][day]T[hour][minute][second][subsecond digits:6]Z"
    );
    let stamp = at
        .to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("{stem}{SNAPSHOT_MARKER}{stamp}{SNAPSHOT_EXTENSION}")
}

fn is_snapshot_name(stem: &str, name: &str) -> bool {
    let Some(rest) = name.strip_prefix(stem).and_then(|r| r.strip_prefix(SNAPSHOT_MARKER)) else {
        return false;
    };
    let Some(stamp) = rest.strip_suffix(SNAPSHOT_EXTENSION) else {
        return false;
    };
    let bytes = stamp.as_bytes();
    bytes.len() == TIMESTAMP_LEN
        && bytes[8] == b'T'
        && bytes[TIMESTAMP_LEN - 1] == b'Z'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || i == TIMESTAMP_LEN - 1 || b.is_ascii_digit())
}

/// Snapshots belonging to `store_path`, oldest first
pub fn list_snapshots(store_path: &Path) -> io::Result<Vec<PathBuf>> {
    let dir = store_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = store_stem(store_path);

    let mut snapshots = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(snapshots),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_snapshot_name(&stem, &name) && entry.file_type()?.is_file() {
            snapshots.push(entry.path());
        }
    }
    snapshots.sort();
    Ok(snapshots)
}

/// Copy the store file aside before migrations run.
///
/// `conn` must be the open handle for `store_path`; the WAL is checkpointed
/// first so the copy is a complete database. A missing or empty store file
/// has nothing worth keeping and is skipped.
pub fn snapshot_before_migration(conn: &Connection, store_path: &Path) -> Advisory {
    match take_snapshot(conn, store_path) {
        Ok(Some(path)) => {
            tracing::info!(snapshot = %path.display(), "pre-migration snapshot written");
            Advisory::Completed
        }
        Ok(None) => {
            tracing::debug!(path = %store_path.display(), "store is empty, snapshot skipped");
            Advisory::Completed
        }
        Err(e) => Advisory::failure(format!("snapshot of {} failed: {e}", store_path.display())),
    }
}

fn take_snapshot(conn: &Connection, store_path: &Path) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    match fs::metadata(store_path) {
        Ok(meta) if meta.len() == 0 => return Ok(None),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;

    let dir = store_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = store_stem(store_path);
    let mut at = OffsetDateTime::now_utc();
    let mut target = dir.join(snapshot_file_name(&stem, at));
    while target.exists() {
        at += Duration::microseconds(1);
        target = dir.join(snapshot_file_name(&stem, at));
    }

    fs::copy(store_path, &target)?;
    set_secure_permissions(&target, FILE_PERMISSIONS)?;
    Ok(Some(target))
}

/// Keep the newest `keep` snapshots of `store_path` and delete the rest
pub fn prune_snapshots(store_path: &Path, keep: usize) -> Advisory {
    let snapshots = match list_snapshots(store_path) {
        Ok(snapshots) => snapshots,
        Err(e) => return Advisory::failure(format!("listing snapshots failed: {e}")),
    };
    if snapshots.len() <= keep {
        return Advisory::Completed;
    }

    let excess = snapshots.len() - keep;
    let mut failures = Vec::new();
    for old in snapshots.iter().take(excess) {
        match fs::remove_file(old) {
            Ok(()) => tracing::debug!(snapshot = %old.display(), "pruned snapshot"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => failures.push(format!("{}: {e}", old.display())),
        }
    }

    if failures.is_empty() {
        tracing::info!(removed = excess, kept = keep, "snapshot retention applied");
        Advisory::Completed
    } else {
        Advisory::failure(format!("could not prune {}", failures.join(", ")))
    }
}
