//! Shared fixtures for vaultkeeper integration tests

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vaultkeeper::{MasterKey, StaticKeyProvider, StoreConfig, StoreManager};

/// Schema an older, unencrypted release left on disk (baseline tables, no
/// version table, no later columns)
pub const LEGACY_PLAINTEXT: &str = r"
    CREATE TABLE users_local (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        display_name TEXT,
        created_at TEXT NOT NULL DEFAULT '2023-01-01T00:00:00Z',
        updated_at TEXT NOT NULL DEFAULT '2023-01-01T00:00:00Z'
    );
    CREATE TABLE contacts (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
        display_name TEXT NOT NULL,
        email TEXT,
        phone TEXT,
        company TEXT,
        created_at TEXT NOT NULL DEFAULT '2023-01-01T00:00:00Z',
        updated_at TEXT NOT NULL DEFAULT '2023-01-01T00:00:00Z'
    );
    CREATE TABLE transactions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
        property_address TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        started_at TEXT,
        closed_at TEXT,
        created_at TEXT NOT NULL DEFAULT '2023-01-01T00:00:00Z',
        updated_at TEXT NOT NULL DEFAULT '2023-01-01T00:00:00Z'
    );
    CREATE INDEX idx_contacts_user ON contacts(user_id);

    INSERT INTO users_local (id, email) VALUES ('local-1', 'agent@example.com');
    INSERT INTO contacts (id, user_id, display_name, email) VALUES
        ('c1', 'local-1', 'Dana Buyer', 'dana@example.com'),
        ('c2', 'local-1', 'Sam Seller', NULL);
    INSERT INTO transactions (id, user_id, property_address, status, updated_at) VALUES
        ('t1', 'local-1', '12 Harbor Rd', 'closed', '2023-06-30T12:00:00Z'),
        ('t2', 'local-1', '7 Pine Ct', 'active', '2023-07-01T09:00:00Z');
";

pub struct TestContext {
    pub temp_dir: TempDir,
    pub store_path: PathBuf,
    pub key: MasterKey,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let store_path = temp_dir.path().join("vaultkeeper.db");
        Ok(Self {
            temp_dir,
            store_path,
            key: MasterKey::generate(),
        })
    }

    /// Same directory, pre-populated with an unencrypted legacy store
    pub fn with_legacy_plaintext() -> anyhow::Result<Self> {
        let ctx = Self::new()?;
        let conn = Connection::open(&ctx.store_path)?;
        conn.execute_batch(LEGACY_PLAINTEXT)?;
        conn.close().map_err(|(_, e)| e)?;
        Ok(ctx)
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::at(&self.store_path)
    }

    pub fn manager(&self) -> StoreManager {
        self.manager_with_key(&self.key)
    }

    pub fn manager_with_key(&self, key: &MasterKey) -> StoreManager {
        StoreManager::new(self.config(), Box::new(StaticKeyProvider::new(key.clone())))
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn file_contains(&self, needle: &str) -> anyhow::Result<bool> {
        let raw = std::fs::read(&self.store_path)?;
        Ok(String::from_utf8_lossy(&raw).contains(needle))
    }
}
