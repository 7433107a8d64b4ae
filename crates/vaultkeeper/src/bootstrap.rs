//! One-time conversion of a plaintext store into an encrypted one
//!
//! Sequence: checkpoint, copy to `<store>.backup`, rebuild every object into
//! `<store>.encrypted` under the key, verify row counts, shred the plaintext,
//! rename the encrypted copy into place and shred the backup.
//!
//! A crash leaves either the untouched original or the original plus the
//! backup and a partial `.encrypted` file. [`ensure_encrypted`] repairs the
//! latter before doing anything else, so every run starts from a valid state.

use crate::eraser::secure_delete_with_passes;
use crate::error::{Advisory, StoreError};
use crate::security::{apply_key_pragma, set_secure_permissions, KeyProvider, MasterKey, FILE_PERMISSIONS};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// No file yet; it will be created encrypted
    NewStore,
    AlreadyEncrypted,
    /// `erasure` reports shredding of the plaintext original, its sidecars and the backup
    Converted {
        tables: usize,
        rows: u64,
        erasure: Advisory,
    },
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Plaintext copy kept while a conversion is in flight
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".backup")
}

/// Encrypted copy being built during a conversion
pub fn encrypted_path(path: &Path) -> PathBuf {
    with_suffix(path, ".encrypted")
}

fn sidecars(path: &Path) -> [PathBuf; 3] {
    [
        with_suffix(path, "-wal"),
        with_suffix(path, "-shm"),
        with_suffix(path, "-journal"),
    ]
}

fn stage<E: std::fmt::Display>(stage: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Bootstrap {
        stage,
        reason: e.to_string(),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn discard_partial_copy(path: &Path) -> io::Result<()> {
    let target = encrypted_path(path);
    remove_if_present(&target)?;
    for sidecar in sidecars(&target) {
        remove_if_present(&sidecar)?;
    }
    Ok(())
}

fn restore_from_backup(path: &Path) -> Result<(), StoreError> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Err(StoreError::BootstrapUnrecoverable(format!(
            "{} is damaged or missing and no backup exists",
            path.display()
        )));
    }
    for sidecar in sidecars(path) {
        remove_if_present(&sidecar).map_err(|e| StoreError::BootstrapUnrecoverable(e.to_string()))?;
    }
    fs::rename(&backup, path).map_err(|e| {
        StoreError::BootstrapUnrecoverable(format!("restoring {} failed: {e}", backup.display()))
    })?;
    tracing::warn!(path = %path.display(), "store restored from bootstrap backup");
    Ok(())
}

/// Bring the directory back to "original only" after an interrupted run.
///
/// A `.encrypted` file is only ever created once the backup is complete, so
/// its presence means the backup is authoritative and the original may be
/// half-shredded.
fn recover_interrupted(path: &Path, passes: u32) -> Result<(), StoreError> {
    let backup = backup_path(path);
    let partial = encrypted_path(path).exists();

    if partial {
        tracing::warn!(path = %path.display(), "discarding partial encrypted copy from an interrupted run");
        discard_partial_copy(path).map_err(stage("recover"))?;
    }
    if !backup.exists() {
        return Ok(());
    }
    if partial || !path.exists() {
        return restore_from_backup(path);
    }

    // Original is intact (still plaintext, or conversion finished); the backup is stale plaintext
    let _stale_backup = secure_delete_with_passes(&backup, passes).log("remove stale bootstrap backup");
    Ok(())
}

/// Undo a failed conversion. `original_erased` is set once shredding began.
fn roll_back(path: &Path, passes: u32, original_erased: bool) -> Result<(), StoreError> {
    if let Err(e) = discard_partial_copy(path) {
        tracing::warn!(path = %path.display(), error = %e, "could not remove partial encrypted copy");
    }
    if original_erased || !path.exists() {
        return restore_from_backup(path);
    }
    // The conversion error is what the caller sees; a leftover backup is retried on the next run
    let _backup = secure_delete_with_passes(&backup_path(path), passes).log("remove bootstrap backup after rollback");
    Ok(())
}

/// Make sure the store at `path` is encrypted under `key`.
///
/// Rollback runs on every failure after the backup exists; the original
/// error is returned unless the rollback itself could not restore the data.
pub fn ensure_encrypted(
    path: &Path,
    key: &MasterKey,
    keys: &dyn KeyProvider,
    passes: u32,
) -> Result<BootstrapOutcome, StoreError> {
    recover_interrupted(path, passes)?;

    match fs::metadata(path) {
        Ok(meta) if meta.len() == 0 => return Ok(BootstrapOutcome::NewStore),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BootstrapOutcome::NewStore),
        Err(e) => return Err(e.into()),
    }
    if keys.is_file_encrypted(path) {
        return Ok(BootstrapOutcome::AlreadyEncrypted);
    }

    tracing::info!(path = %path.display(), "plaintext store detected, encrypting");
    checkpoint_plaintext(path).map_err(stage("checkpoint"))?;

    let backup = backup_path(path);
    if let Err(e) = fs::copy(path, &backup) {
        let _ = remove_if_present(&backup);
        return Err(stage("backup")(e));
    }
    if let Err(e) = set_secure_permissions(&backup, FILE_PERMISSIONS) {
        tracing::warn!(path = %backup.display(), error = %e, "could not restrict backup permissions");
    }

    let (tables, rows) = match copy_into_encrypted(path, &encrypted_path(path), key) {
        Ok(copied) => copied,
        Err(err) => {
            roll_back(path, passes, false)?;
            return Err(err);
        }
    };

    let mut erased = vec![secure_delete_with_passes(path, passes).log("erase plaintext store")];
    for sidecar in sidecars(path) {
        erased.push(secure_delete_with_passes(&sidecar, passes).log("erase plaintext sidecar"));
    }

    if let Err(e) = fs::rename(encrypted_path(path), path) {
        roll_back(path, passes, true)?;
        return Err(stage("swap")(e));
    }
    erased.push(secure_delete_with_passes(&backup, passes).log("erase plaintext backup"));

    let erasure = Advisory::merge(erased);
    tracing::info!(path = %path.display(), tables, rows, erasure = %erasure, "store encrypted");
    Ok(BootstrapOutcome::Converted { tables, rows, erasure })
}

fn checkpoint_plaintext(path: &Path) -> rusqlite::Result<()> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    conn.close().map_err(|(_, e)| e)
}

#[derive(Debug)]
struct CatalogEntry {
    kind: String,
    name: String,
    sql: String,
}

impl CatalogEntry {
    fn is_virtual_table(&self) -> bool {
        self.kind == "table"
            && self
                .sql
                .trim_start()
                .get(..20)
                .is_some_and(|head| head.eq_ignore_ascii_case("CREATE VIRTUAL TABLE"))
    }

    /// FTS tables indexing another table's content are rebuilt, not copied
    fn has_external_content(&self) -> bool {
        self.sql.to_ascii_lowercase().replace(' ', "").contains("content=")
    }
}

struct Catalog {
    entries: Vec<CatalogEntry>,
    shadow_tables: HashSet<String>,
    without_rowid: HashSet<String>,
}

fn read_catalog(conn: &Connection) -> rusqlite::Result<Catalog> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY rowid",
    )?;
    let entries = stmt
        .query_map([], |row| {
            Ok(CatalogEntry {
                kind: row.get(0)?,
                name: row.get(1)?,
                sql: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut shadow_tables = HashSet::new();
    let mut without_rowid = HashSet::new();
    // Shadow tables are flagged by the engine itself; their owning virtual table recreates them
    let mut stmt = conn.prepare("SELECT name, type, wr FROM pragma_table_list WHERE schema = 'main'")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let wr: bool = row.get(2)?;
        if kind == "shadow" {
            shadow_tables.insert(name.clone());
        }
        if wr {
            without_rowid.insert(name);
        }
    }

    Ok(Catalog {
        entries,
        shadow_tables,
        without_rowid,
    })
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Columns that accept values: hidden and generated columns are left out
fn insertable_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_xinfo(?1) WHERE hidden = 0 ORDER BY cid")?;
    let columns = stmt
        .query_map(params![table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(columns)
}

/// Whether the table has an `INTEGER PRIMARY KEY` column standing in for the rowid
fn has_rowid_alias(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let pk_types = conn
        .prepare("SELECT type FROM pragma_table_xinfo(?1) WHERE pk > 0")?
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pk_types.len() == 1 && pk_types[0].eq_ignore_ascii_case("INTEGER"))
}

/// Every table or virtual table a conversion must carry over
fn user_tables(conn: &Connection) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_list
         WHERE schema = 'main' AND type IN ('table', 'virtual')
           AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;
    Ok(names)
}

fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    conn.query_row(&format!("SELECT count(*) FROM {}", quote_ident(table)), [], |row| {
        row.get(0)
    })
}

/// Stream every row of `table` into `dst` inside one write transaction
fn copy_rows(src: &Connection, dst: &mut Connection, table: &str, keep_rowid: bool) -> rusqlite::Result<u64> {
    let columns = insertable_columns(src, table)?;
    let keep_rowid = keep_rowid
        && !has_rowid_alias(src, table)?
        && !columns.iter().any(|c| c.eq_ignore_ascii_case("_rowid_"));

    let mut selected: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    if keep_rowid {
        selected.insert(0, "_rowid_".to_string());
    }
    if selected.is_empty() {
        return Ok(0);
    }

    let list = selected.join(", ");
    let placeholders = (1..=selected.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
    let order = if keep_rowid { " ORDER BY _rowid_" } else { "" };
    let select = format!("SELECT {list} FROM {}{order}", quote_ident(table));
    let insert = format!("INSERT INTO {} ({list}) VALUES ({placeholders})", quote_ident(table));

    let tx = dst.transaction()?;
    let mut copied = 0u64;
    {
        let mut read = src.prepare(&select)?;
        let mut write = tx.prepare(&insert)?;
        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            let values = (0..selected.len())
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            write.execute(params_from_iter(values.iter()))?;
            copied += 1;
        }
    }
    tx.commit()?;
    Ok(copied)
}

fn execute_tolerating_existing(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    match conn.execute_batch(sql) {
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("already exists") => Ok(()),
        other => other,
    }
}

fn copy_sequences(src: &Connection, dst: &Connection) -> rusqlite::Result<()> {
    let has_sequences: bool = src.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'sqlite_sequence')",
        [],
        |row| row.get(0),
    )?;
    if !has_sequences {
        return Ok(());
    }
    dst.execute_batch("DELETE FROM sqlite_sequence;")?;
    let mut read = src.prepare("SELECT name, seq FROM sqlite_sequence")?;
    let mut rows = read.query([])?;
    while let Some(row) = rows.next()? {
        dst.execute(
            "INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)",
            params![row.get::<_, String>(0)?, row.get::<_, i64>(1)?],
        )?;
    }
    Ok(())
}

/// Rebuild the plaintext store at `source` as an encrypted file at `target`.
/// Returns (tables copied, rows copied).
fn copy_into_encrypted(source: &Path, target: &Path, key: &MasterKey) -> Result<(usize, u64), StoreError> {
    let src = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(stage("open source"))?;
    let catalog = read_catalog(&src).map_err(stage("catalog"))?;

    let mut dst = Connection::open(target).map_err(stage("open target"))?;
    apply_key_pragma(&dst, "key", key).map_err(stage("open target"))?;

    let mut tables = 0usize;
    let mut rows = 0u64;
    let mut verify = Vec::new();
    let mut rebuilds = Vec::new();

    let copyable = catalog
        .entries
        .iter()
        .filter(|e| e.kind == "table" && !catalog.shadow_tables.contains(&e.name));
    for entry in copyable {
        dst.execute_batch(&entry.sql).map_err(stage("create table"))?;
        if entry.is_virtual_table() && entry.has_external_content() {
            rebuilds.push(entry.name.as_str());
            tables += 1;
            continue;
        }

        let keep_rowid = !catalog.without_rowid.contains(&entry.name);
        let copied = copy_rows(&src, &mut dst, &entry.name, keep_rowid).map_err(stage("copy"))?;
        tracing::info!(table = %entry.name, rows = copied, "table copied");
        tables += 1;
        rows += copied;
        verify.push((entry.name.as_str(), copied));
    }

    // Content tables may follow their index in the catalog, so rebuild once every row is in
    for name in rebuilds {
        let rebuild = format!("INSERT INTO {0}({0}) VALUES ('rebuild')", quote_ident(name));
        if let Err(e) = dst.execute_batch(&rebuild) {
            tracing::warn!(table = %name, error = %e, "external-content index left empty");
        }
    }

    for entry in catalog.entries.iter().filter(|e| e.kind == "view") {
        execute_tolerating_existing(&dst, &entry.sql).map_err(stage("create view"))?;
    }
    for entry in catalog.entries.iter().filter(|e| e.kind == "index" || e.kind == "trigger") {
        execute_tolerating_existing(&dst, &entry.sql).map_err(stage("create index"))?;
    }

    copy_sequences(&src, &dst).map_err(stage("copy"))?;
    let user_version: i64 = src
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(stage("copy"))?;
    dst.execute_batch(&format!("PRAGMA user_version = {user_version};"))
        .map_err(stage("copy"))?;

    let source_tables = user_tables(&src).map_err(stage("verify"))?;
    let target_tables = user_tables(&dst).map_err(stage("verify"))?;
    if let Some(missing) = source_tables.difference(&target_tables).next() {
        return Err(StoreError::Bootstrap {
            stage: "verify",
            reason: format!("{missing} is missing from the encrypted copy"),
        });
    }

    for (table, expected) in verify {
        let source_rows = row_count(&src, table).map_err(stage("verify"))?;
        let target_rows = row_count(&dst, table).map_err(stage("verify"))?;
        if source_rows != expected || target_rows != expected {
            return Err(StoreError::Bootstrap {
                stage: "verify",
                reason: format!("{table}: {source_rows} source rows, {target_rows} copied"),
            });
        }
    }

    dst.close().map_err(|(_, e)| stage("close")(e))?;
    src.close().map_err(|(_, e)| stage("close")(e))?;
    Ok((tables, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{probe_file_encrypted, StaticKeyProvider};
    use rusqlite::functions::FunctionFlags;
    use tempfile::tempdir;

    const LEGACY: &str = r"
        CREATE TABLE users_local (id TEXT PRIMARY KEY, email TEXT NOT NULL);
        CREATE TABLE notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT REFERENCES users_local(id),
            body TEXT,
            blob BLOB,
            score REAL,
            body_len INTEGER GENERATED ALWAYS AS (length(body)) VIRTUAL
        );
        CREATE TABLE tags (name TEXT PRIMARY KEY, weight INTEGER) WITHOUT ROWID;
        CREATE INDEX idx_notes_user ON notes(user_id);
        CREATE VIEW note_count AS SELECT user_id, count(*) AS n FROM notes GROUP BY user_id;
        CREATE TRIGGER notes_touch AFTER INSERT ON notes BEGIN SELECT 1; END;
        CREATE VIRTUAL TABLE notes_fts USING fts5(body);

        INSERT INTO users_local VALUES ('u1', 'a@example.com');
        INSERT INTO notes (user_id, body, blob, score) VALUES ('u1', 'hello', x'00ff10', 1.5);
        INSERT INTO notes (user_id, body, blob, score) VALUES ('u1', NULL, NULL, NULL);
        INSERT INTO notes (user_id, body, blob, score) VALUES ('u1', 'doomed', NULL, 0);
        DELETE FROM notes WHERE body = 'doomed';
        INSERT INTO tags VALUES ('urgent', 3), ('later', 1);
        INSERT INTO notes_fts (rowid, body) VALUES (1, 'hello world');
        PRAGMA user_version = 7;
    ";

    fn plaintext_store(path: &Path) -> anyhow::Result<()> {
        let conn = Connection::open(path)?;
        conn.execute_batch(LEGACY)?;
        Ok(())
    }

    fn dump(conn: &Connection) -> anyhow::Result<Vec<(i64, Option<String>, Option<Vec<u8>>, Option<f64>)>> {
        let mut stmt = conn.prepare("SELECT id, body, blob, score FROM notes ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn open_keyed(path: &Path, key: &MasterKey) -> anyhow::Result<Connection> {
        let conn = Connection::open(path)?;
        apply_key_pragma(&conn, "key", key)?;
        Ok(conn)
    }

    #[test]
    fn converts_plaintext_and_keeps_every_row() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        plaintext_store(&path)?;
        let before = dump(&Connection::open(&path)?)?;

        let key = MasterKey::generate();
        let outcome = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3)?;

        assert!(matches!(
            outcome,
            BootstrapOutcome::Converted { tables: 4, erasure: Advisory::Completed, .. }
        ));
        assert!(probe_file_encrypted(&path));
        assert!(!backup_path(&path).exists());
        assert!(!encrypted_path(&path).exists());

        let conn = open_keyed(&path, &key)?;
        assert_eq!(dump(&conn)?, before);
        let body_len: i64 = conn.query_row("SELECT body_len FROM notes WHERE id = 1", [], |r| r.get(0))?;
        assert_eq!(body_len, 5);
        let weight: i64 = conn.query_row("SELECT weight FROM tags WHERE name = 'urgent'", [], |r| r.get(0))?;
        assert_eq!(weight, 3);
        let hits: i64 = conn.query_row(
            "SELECT count(*) FROM notes_fts WHERE notes_fts MATCH 'world'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(hits, 1);
        let n: i64 = conn.query_row("SELECT n FROM note_count WHERE user_id = 'u1'", [], |r| r.get(0))?;
        assert_eq!(n, 2);
        let seq: i64 = conn.query_row("SELECT seq FROM sqlite_sequence WHERE name = 'notes'", [], |r| r.get(0))?;
        assert_eq!(seq, 3);
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        assert_eq!(version, 7);
        Ok(())
    }

    #[test]
    fn plain_tables_named_like_fts_internals_are_copied() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                "CREATE VIRTUAL TABLE notes USING fts5(body);
                 CREATE TABLE notes_parent (id INTEGER PRIMARY KEY, label TEXT NOT NULL);
                 CREATE TABLE notes_stat (name TEXT PRIMARY KEY, hits INTEGER);
                 INSERT INTO notes (body) VALUES ('hello');
                 INSERT INTO notes_parent (label) VALUES ('inbox'), ('archive');
                 INSERT INTO notes_stat VALUES ('opened', 4);",
            )?;
        }

        let key = MasterKey::generate();
        let outcome = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3)?;

        assert!(matches!(outcome, BootstrapOutcome::Converted { tables: 3, rows: 4, .. }));
        let conn = open_keyed(&path, &key)?;
        let labels: Vec<String> = conn
            .prepare("SELECT label FROM notes_parent ORDER BY id")?
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(labels, vec!["inbox".to_string(), "archive".to_string()]);
        let hits: i64 = conn.query_row("SELECT hits FROM notes_stat WHERE name = 'opened'", [], |r| r.get(0))?;
        assert_eq!(hits, 4);
        let found: i64 = conn.query_row("SELECT count(*) FROM notes WHERE notes MATCH 'hello'", [], |r| r.get(0))?;
        assert_eq!(found, 1);
        Ok(())
    }

    #[test]
    fn external_content_index_declared_before_its_table_is_rebuilt() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                "CREATE VIRTUAL TABLE docs_fts USING fts5(body, content='docs', content_rowid='id');
                 CREATE TABLE docs (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
                 INSERT INTO docs (body) VALUES ('closing at harbor road'), ('pine court listing');
                 INSERT INTO docs_fts (docs_fts) VALUES ('rebuild');",
            )?;
        }

        let key = MasterKey::generate();
        let outcome = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3)?;

        assert!(matches!(outcome, BootstrapOutcome::Converted { tables: 2, rows: 2, .. }));
        let conn = open_keyed(&path, &key)?;
        let hits: i64 = conn.query_row(
            "SELECT count(*) FROM docs_fts WHERE docs_fts MATCH 'harbor'",
            [],
            |r| r.get(0),
        )?;
        assert_eq!(hits, 1);
        Ok(())
    }

    #[test]
    fn absent_and_encrypted_files_are_left_alone() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let key = MasterKey::generate();
        let keys = StaticKeyProvider::new(key.clone());

        assert_eq!(ensure_encrypted(&path, &key, &keys, 3)?, BootstrapOutcome::NewStore);
        assert!(!path.exists());

        let conn = open_keyed(&path, &key)?;
        conn.execute_batch("CREATE TABLE t (v TEXT);")?;
        drop(conn);
        assert_eq!(ensure_encrypted(&path, &key, &keys, 3)?, BootstrapOutcome::AlreadyEncrypted);
        Ok(())
    }

    #[test]
    fn failed_copy_rolls_back_to_original() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        {
            let conn = Connection::open(&path)?;
            conn.create_scalar_function("shout", 1, FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC, |ctx| {
                Ok(ctx.get::<String>(0)?.to_uppercase())
            })?;
            conn.execute_batch(
                "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
                 CREATE INDEX idx_shout ON notes(shout(body));
                 INSERT INTO notes (body) VALUES ('quiet');",
            )?;
        }
        let original = fs::read(&path)?;

        let key = MasterKey::generate();
        let err = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3).err();

        assert!(matches!(err, Some(StoreError::Bootstrap { stage: "create index", .. })));
        assert_eq!(fs::read(&path)?, original);
        assert!(!probe_file_encrypted(&path));
        assert!(!backup_path(&path).exists());
        assert!(!encrypted_path(&path).exists());
        Ok(())
    }

    #[test]
    fn interrupted_copy_is_discarded_and_rerun() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        plaintext_store(&path)?;
        let before = dump(&Connection::open(&path)?)?;
        fs::copy(&path, backup_path(&path))?;
        fs::write(encrypted_path(&path), b"half-written garbage")?;

        let key = MasterKey::generate();
        let outcome = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3)?;

        assert!(matches!(outcome, BootstrapOutcome::Converted { .. }));
        assert_eq!(dump(&open_keyed(&path, &key)?)?, before);
        assert!(!backup_path(&path).exists());
        assert!(!encrypted_path(&path).exists());
        Ok(())
    }

    #[test]
    fn missing_original_is_restored_from_backup() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        plaintext_store(&path)?;
        let before = dump(&Connection::open(&path)?)?;
        fs::rename(&path, backup_path(&path))?;

        let key = MasterKey::generate();
        let outcome = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3)?;

        assert!(matches!(outcome, BootstrapOutcome::Converted { .. }));
        assert_eq!(dump(&open_keyed(&path, &key)?)?, before);
        assert!(!backup_path(&path).exists());
        Ok(())
    }

    #[test]
    fn leftover_backup_after_swap_is_shredded() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let key = MasterKey::generate();
        let conn = open_keyed(&path, &key)?;
        conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('x');")?;
        drop(conn);
        plaintext_store(&backup_path(&path))?;

        let outcome = ensure_encrypted(&path, &key, &StaticKeyProvider::new(key.clone()), 3)?;

        assert_eq!(outcome, BootstrapOutcome::AlreadyEncrypted);
        assert!(!backup_path(&path).exists());
        Ok(())
    }

    #[test]
    fn nothing_to_restore_is_unrecoverable() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        assert!(matches!(
            restore_from_backup(&path),
            Err(StoreError::BootstrapUnrecoverable(_))
        ));
        Ok(())
    }
}
