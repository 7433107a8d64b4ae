//! Store configuration

use crate::eraser::MIN_PASSES;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = "Vaultkeeper";
pub const STORE_FILE_NAME: &str = "vaultkeeper.db";
pub const DEFAULT_BACKUP_RETENTION: usize = 3;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Application data directory: `<data_dir>/Vaultkeeper`
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Default store file location
pub fn default_store_path() -> PathBuf {
    app_data_dir().join(STORE_FILE_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Pre-migration snapshots kept after each migration run
    pub backup_retention: usize,
    pub secure_delete_passes: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            backup_retention: DEFAULT_BACKUP_RETENTION,
            secure_delete_passes: MIN_PASSES,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Defaults with an explicit store path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.path.as_os_str().is_empty() {
            return Err(StoreError::Config("store path is empty".into()));
        }
        if self.backup_retention == 0 {
            return Err(StoreError::Config("backup_retention must be at least 1".into()));
        }
        if self.secure_delete_passes < MIN_PASSES {
            return Err(StoreError::Config(format!(
                "secure_delete_passes must be at least {MIN_PASSES}"
            )));
        }
        Ok(())
    }

    /// Directory holding the store and its snapshots
    pub fn store_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}
