//! Error types for the store lifecycle
//!
//! Correctness-critical failures (key, bootstrap, migration, integrity) are
//! `StoreError` values and always propagate. Housekeeping (snapshots,
//! retention, secure delete) reports through [`Advisory`] instead, so call
//! sites can surface a warning without treating it as fatal.

use crate::security::KeyError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store not initialized")]
    NotInitialized,
    #[error("Encryption key rejected by the store")]
    KeyInvalid,
    #[error("Migration v{version} ({description}) failed: {reason}")]
    Migration {
        version: i64,
        description: String,
        reason: String,
    },
    #[error("Store schema v{stored} is newer than this build supports (v{supported})")]
    SchemaTooNew { stored: i64, supported: i64 },
    #[error("Invalid schema definition: {0}")]
    InvalidSchema(String),
    #[error("Encryption bootstrap failed during {stage}: {reason}")]
    Bootstrap { stage: &'static str, reason: String },
    #[error("Encryption bootstrap could not restore the original store: {0}")]
    BootstrapUnrecoverable(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Store corruption detected: {0}")]
    Corruption(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Key provider error: {0}")]
    Security(#[from] KeyError),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse grouping used by hosts to decide how to present a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotInitialized,
    KeyInvalid,
    Migration,
    Bootstrap,
    Integrity,
    Input,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "not_initialized"),
            Self::KeyInvalid => write!(f, "key_invalid"),
            Self::Migration => write!(f, "migration"),
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Integrity => write!(f, "integrity"),
            Self::Input => write!(f, "input"),
            Self::Io => write!(f, "io"),
        }
    }
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotInitialized => ErrorCategory::NotInitialized,
            Self::KeyInvalid | Self::Security(_) => ErrorCategory::KeyInvalid,
            Self::Migration { .. } | Self::SchemaTooNew { .. } | Self::InvalidSchema(_) => {
                ErrorCategory::Migration
            }
            Self::Bootstrap { .. } | Self::BootstrapUnrecoverable(_) => ErrorCategory::Bootstrap,
            Self::Corruption(_) | Self::Sqlite(_) => ErrorCategory::Integrity,
            Self::InvalidIdentifier(_) | Self::Config(_) => ErrorCategory::Input,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Stable code for hosts that map errors to UI strings
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "DB_NOT_INITIALIZED",
            Self::KeyInvalid => "SECURITY_KEY_INVALID",
            Self::Security(_) => "SECURITY_KEY_UNAVAILABLE",
            Self::Migration { .. } => "DB_MIGRATION_FAILED",
            Self::SchemaTooNew { .. } => "DB_SCHEMA_TOO_NEW",
            Self::InvalidSchema(_) => "DB_SCHEMA_INVALID",
            Self::Bootstrap { .. } => "DB_BOOTSTRAP_FAILED",
            Self::BootstrapUnrecoverable(_) => "DB_BOOTSTRAP_UNRECOVERABLE",
            Self::InvalidIdentifier(_) => "VALIDATION_INVALID_IDENTIFIER",
            Self::Corruption(_) => "DB_INTEGRITY_ERROR",
            Self::Config(_) => "VALIDATION_INVALID_CONFIG",
            Self::Sqlite(_) => "DB_QUERY_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Message suitable for showing to the person whose data this is
    pub fn user_message(&self) -> &'static str {
        match self.category() {
            ErrorCategory::KeyInvalid => "Cannot unlock your data. The encryption key was not accepted.",
            ErrorCategory::NotInitialized => "Your data is not open yet.",
            ErrorCategory::Input => "The request was not valid.",
            // A failed conversion is rolled back to the original file
            ErrorCategory::Bootstrap => "Could not open your data. Nothing was changed.",
            // Earlier migrations in the same run may already have committed
            ErrorCategory::Migration | ErrorCategory::Integrity | ErrorCategory::Io => {
                "Could not open your data."
            }
        }
    }
}

/// Outcome of a best-effort housekeeping step
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Advisory {
    Completed,
    AdvisoryFailure(String),
}

impl Advisory {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::AdvisoryFailure(reason.into())
    }

    /// Fold several outcomes into one; failure reasons are joined
    pub fn merge(outcomes: impl IntoIterator<Item = Advisory>) -> Self {
        let reasons: Vec<String> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                Self::Completed => None,
                Self::AdvisoryFailure(reason) => Some(reason),
            })
            .collect();
        if reasons.is_empty() {
            Self::Completed
        } else {
            Self::AdvisoryFailure(reasons.join("; "))
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::AdvisoryFailure(_))
    }

    /// Emit a warning for failures and hand the value back
    pub fn log(self, context: &str) -> Self {
        if let Self::AdvisoryFailure(reason) = &self {
            tracing::warn!(context, %reason, "housekeeping step failed");
        }
        self
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::AdvisoryFailure(reason) => write!(f, "advisory failure: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(StoreError::NotInitialized.category(), ErrorCategory::NotInitialized);
        assert_eq!(StoreError::KeyInvalid.category(), ErrorCategory::KeyInvalid);
        let migration = StoreError::Migration {
            version: 12,
            description: "threads".into(),
            reason: "boom".into(),
        };
        assert_eq!(migration.category(), ErrorCategory::Migration);
        assert_eq!(migration.code(), "DB_MIGRATION_FAILED");
        assert!(migration.to_string().contains("v12"));
    }

    #[test]
    fn bootstrap_failures_surface_could_not_open() {
        let err = StoreError::Bootstrap { stage: "copy", reason: "disk full".into() };
        assert_eq!(err.user_message(), "Could not open your data. Nothing was changed.");
        assert!(StoreError::KeyInvalid.user_message().starts_with("Cannot unlock"));
    }

    #[test]
    fn migration_failures_do_not_promise_an_unchanged_store() {
        let err = StoreError::Migration {
            version: 13,
            description: "view rewrite".into(),
            reason: "no such table".into(),
        };
        assert_eq!(err.user_message(), "Could not open your data.");
        assert!(!err.user_message().contains("Nothing was changed"));
    }

    #[test]
    fn merged_advisories_keep_every_failure() {
        assert_eq!(
            Advisory::merge([Advisory::Completed, Advisory::Completed]),
            Advisory::Completed
        );
        let merged = Advisory::merge([
            Advisory::failure("wal busy"),
            Advisory::Completed,
            Advisory::failure("backup locked"),
        ]);
        assert_eq!(merged, Advisory::failure("wal busy; backup locked"));
    }

    #[test]
    fn advisory_reports_failure() {
        assert!(!Advisory::Completed.is_failure());
        let failed = Advisory::failure("permission denied").log("test");
        assert!(failed.is_failure());
        assert_eq!(failed.to_string(), "advisory failure: permission denied");
    }
}
