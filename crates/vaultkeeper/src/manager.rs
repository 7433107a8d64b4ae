//! Lifecycle surface handed to the host application
//!
//! A `StoreManager` is an ordinary owned value: construct one per store,
//! pass it where it is needed, drop it to close.

use crate::backup::list_snapshots;
use crate::bootstrap::{ensure_encrypted, BootstrapOutcome};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::identity::{migrate_identifier, IdentifierRemapReport};
use crate::maintenance::{self, ReindexResult};
use crate::migrations::{run_migrations, schema_status, MigrationReport, SchemaStatus};
use crate::schema::SchemaDefinition;
use crate::security::{KeyProvider, MasterKey};
use crate::store::Store;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What the most recent successful `initialize` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub bootstrap: BootstrapOutcome,
    pub migrations: MigrationReport,
}

pub struct StoreManager {
    config: StoreConfig,
    keys: Box<dyn KeyProvider>,
    schema: SchemaDefinition,
    store: Option<Store>,
    last_init: Option<InitReport>,
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("path", &self.config.path)
            .field("initialized", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl StoreManager {
    /// Manager for the standard schema
    pub fn new(config: StoreConfig, keys: Box<dyn KeyProvider>) -> Self {
        Self::with_schema(config, keys, SchemaDefinition::standard())
    }

    pub fn with_schema(config: StoreConfig, keys: Box<dyn KeyProvider>, schema: SchemaDefinition) -> Self {
        Self {
            config,
            keys,
            schema,
            store: None,
            last_init: None,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Open the store, encrypting and migrating it as needed.
    ///
    /// Returns immediately when already initialized. On any failure the
    /// manager stays uninitialized and no handle is kept.
    ///
    /// # Errors
    /// `KeyInvalid` when the key does not unlock the file, `Bootstrap*` when
    /// conversion fails, `Migration`/`SchemaTooNew` when the schema cannot
    /// be brought up to date, `Corruption` when the integrity check fails.
    pub fn initialize(&mut self) -> Result<bool, StoreError> {
        if self.store.is_some() {
            return Ok(true);
        }
        self.config.validate()?;
        self.schema.validate()?;

        let path = self.config.path.clone();
        let key = self.keys.encryption_key()?;

        let bootstrap = ensure_encrypted(&path, &key, self.keys.as_ref(), self.config.secure_delete_passes)?;
        let mut store = Store::open(&path, &key, &self.config)?;
        store.check_integrity()?;
        let migrations = run_migrations(store.conn_mut(), &path, &self.schema, self.config.backup_retention)?;

        tracing::info!(
            path = %path.display(),
            version = migrations.to_version,
            applied = migrations.applied.len(),
            "store initialized"
        );
        self.store = Some(store);
        self.last_init = Some(InitReport { bootstrap, migrations });
        Ok(true)
    }

    pub fn is_initialized(&self) -> bool {
        self.store.is_some()
    }

    pub fn last_init(&self) -> Option<&InitReport> {
        self.last_init.as_ref()
    }

    pub fn store(&self) -> Result<&Store, StoreError> {
        self.store.as_ref().ok_or(StoreError::NotInitialized)
    }

    fn store_mut(&mut self) -> Result<&mut Store, StoreError> {
        self.store.as_mut().ok_or(StoreError::NotInitialized)
    }

    /// The open connection for domain services
    pub fn handle(&self) -> Result<&Connection, StoreError> {
        Ok(self.store()?.conn())
    }

    /// Close the store. Closing an unopened manager does nothing.
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.last_init = None;
        match self.store.take() {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }

    /// Re-encrypt under `new_key` and hand the key to the provider.
    ///
    /// If the provider refuses the key the store is rekeyed back, so the
    /// file always stays readable with whatever key the provider holds.
    pub fn rekey(&mut self, new_key: &MasterKey) -> Result<(), StoreError> {
        let keys = &self.keys;
        let store = self.store.as_mut().ok_or(StoreError::NotInitialized)?;
        let old_key = store.key().clone();

        store.rekey(new_key)?;
        if let Err(e) = keys.key_rotated(new_key) {
            tracing::warn!(error = %e, "key provider rejected the new key, reverting");
            store.rekey(&old_key)?;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        maintenance::vacuum(self.handle()?)
    }

    pub fn reindex(&mut self) -> Result<ReindexResult, StoreError> {
        Ok(maintenance::reindex(self.store_mut()?.conn_mut()))
    }

    pub fn migrate_identifier(&mut self, old_id: &str, new_id: &str) -> Result<IdentifierRemapReport, StoreError> {
        migrate_identifier(self.store_mut()?.conn_mut(), old_id, new_id)
    }

    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        schema_status(self.handle()?, &self.schema)
    }

    /// Pre-migration snapshots on disk, oldest first
    pub fn snapshots(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(list_snapshots(&self.config.path)?)
    }
}
