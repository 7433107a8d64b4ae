//! Vaultkeeper: lifecycle management for a local, single-writer, encrypted
//! SQLite store.
//!
//! [`StoreManager::initialize`] takes a store from whatever state it is in
//! (absent, plaintext from an older release, encrypted at an older schema
//! version, or interrupted mid-conversion) to an open, encrypted,
//! fully-migrated handle. Key rotation, identifier unification and index
//! maintenance are available once it is open.

pub mod backup;
pub mod bootstrap;
pub mod config;
pub mod eraser;
pub mod error;
pub mod executor;
pub mod identity;
pub mod maintenance;
pub mod manager;
pub mod migrations;
pub mod schema;
pub mod security;
pub mod store;

pub use bootstrap::BootstrapOutcome;
pub use config::StoreConfig;
pub use error::{Advisory, ErrorCategory, StoreError};
pub use executor::{ExecutorError, LifecycleExecutor};
pub use identity::IdentifierRemapReport;
pub use maintenance::ReindexResult;
pub use manager::{InitReport, StoreManager};
pub use migrations::{MigrationReport, SchemaStatus};
pub use schema::{Migration, ReferencingTable, SchemaDefinition};
pub use security::{
    KeyError, KeyProvider, KeychainKeyProvider, MasterKey, PassphraseKeyProvider, StaticKeyProvider,
};
pub use store::Store;
