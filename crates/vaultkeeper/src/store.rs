//! The single open, keyed connection to the store file

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::security::{apply_key_pragma, create_secure_dir, set_secure_permissions, MasterKey, FILE_PERMISSIONS};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Map a failed first read to `KeyInvalid` when the engine cannot decrypt the file
pub(crate) fn classify_key_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::NotADatabase => StoreError::KeyInvalid,
        _ => StoreError::Sqlite(err),
    }
}

pub(crate) fn verify_readable(conn: &Connection) -> Result<(), StoreError> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(classify_key_error)
}

fn set_journal_mode(conn: &Connection, mode: &str) -> rusqlite::Result<String> {
    conn.query_row(&format!("PRAGMA journal_mode = {mode}"), [], |row| row.get(0))
}

#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: PathBuf,
    key: MasterKey,
}

impl Store {
    /// Open (or create) the encrypted store at `path`
    pub fn open(path: &Path, key: &MasterKey, config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists()) {
            create_secure_dir(parent)?;
        }

        let conn = Connection::open(path)?;
        apply_key_pragma(&conn, "key", key)?;
        verify_readable(&conn)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        if let Err(e) = set_journal_mode(&conn, "WAL") {
            tracing::warn!(error = %e, "WAL journal mode unavailable, keeping default");
        }
        conn.execute_batch("PRAGMA secure_delete = ON;")?;

        if let Err(e) = set_secure_permissions(path, FILE_PERMISSIONS) {
            tracing::warn!(path = %path.display(), error = %e, "could not restrict store permissions");
        }

        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            key: key.clone(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn key(&self) -> &MasterKey {
        &self.key
    }

    /// `PRAGMA quick_check`; anything but `ok` is corruption
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        let result: String = self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::Corruption(result));
        }
        Ok(())
    }

    /// Re-encrypt the file under `new_key`.
    ///
    /// The rekey runs in rollback-journal mode; WAL is restored afterwards.
    /// The in-memory key only changes once the file reads back under the new key.
    pub fn rekey(&mut self, new_key: &MasterKey) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        set_journal_mode(&self.conn, "DELETE")?;

        let rekeyed = apply_key_pragma(&self.conn, "rekey", new_key);

        if let Err(e) = set_journal_mode(&self.conn, "WAL") {
            tracing::warn!(error = %e, "could not restore WAL journal mode after rekey");
        }
        rekeyed?;
        verify_readable(&self.conn)?;

        self.key = new_key.clone();
        tracing::info!(path = %self.path.display(), "store rekeyed");
        Ok(())
    }

    /// Close the connection, surfacing any error from the engine
    pub fn close(self) -> Result<(), StoreError> {
        let path = self.path;
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        tracing::debug!(path = %path.display(), "store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_at(path: &Path, key: &MasterKey) -> Result<Store, StoreError> {
        Store::open(path, key, &StoreConfig::at(path))
    }

    #[test]
    fn reopens_with_same_key() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("store.db");
        let key = MasterKey::generate();

        let store = open_at(&path, &key)?;
        store.conn().execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('x');")?;
        store.check_integrity()?;
        store.close()?;

        let store = open_at(&path, &key)?;
        let v: String = store.conn().query_row("SELECT v FROM t", [], |row| row.get(0))?;
        assert_eq!(v, "x");
        Ok(())
    }

    #[test]
    fn wrong_key_is_key_invalid() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let store = open_at(&path, &MasterKey::generate())?;
        store.conn().execute_batch("CREATE TABLE t (v TEXT);")?;
        store.close()?;

        let err = open_at(&path, &MasterKey::generate()).err();
        assert!(matches!(err, Some(StoreError::KeyInvalid)));
        Ok(())
    }

    #[test]
    fn rekey_switches_key() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let old_key = MasterKey::generate();
        let new_key = MasterKey::generate();

        let mut store = open_at(&path, &old_key)?;
        store.conn().execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('x');")?;
        store.rekey(&new_key)?;
        assert_eq!(store.key().as_bytes(), new_key.as_bytes());
        store.close()?;

        assert!(matches!(open_at(&path, &old_key).err(), Some(StoreError::KeyInvalid)));
        let store = open_at(&path, &new_key)?;
        let count: i64 = store.conn().query_row("SELECT count(*) FROM t", [], |row| row.get(0))?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn foreign_keys_are_enforced() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.db");
        let store = open_at(&path, &MasterKey::generate())?;
        let enabled: i64 = store.conn().query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(enabled, 1);
        Ok(())
    }
}
