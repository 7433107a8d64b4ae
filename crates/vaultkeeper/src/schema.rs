//! Schema boundary: the baseline script, versioned migration descriptors,
//! the performance index set and the tables that reference a user id.
//!
//! Every statement in [`BASELINE_SQL`] is guarded (`IF NOT EXISTS`) so the
//! script can run against a brand-new file and a long-lived one alike.

use crate::error::StoreError;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

/// Version fully represented by [`BASELINE_SQL`]
pub const BASELINE_VERSION: i64 = 10;

pub const BASELINE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users_local (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    display_name TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
    token_hash TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS oauth_tokens (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    access_token BLOB,
    refresh_token BLOB,
    expires_at TEXT,
    UNIQUE (user_id, provider)
);

CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
    display_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    company TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
    property_address TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active'
        CHECK (status IN ('active', 'pending', 'closed', 'cancelled')),
    started_at TEXT,
    closed_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS transaction_contacts (
    transaction_id TEXT NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
    contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    role TEXT,
    PRIMARY KEY (transaction_id, contact_id)
);

CREATE TABLE IF NOT EXISTS communications (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
    transaction_id TEXT REFERENCES transactions(id) ON DELETE SET NULL,
    channel TEXT NOT NULL,
    subject TEXT,
    body TEXT,
    sent_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS submissions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users_local(id) ON DELETE CASCADE,
    transaction_id TEXT NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'draft',
    submitted_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS user_preferences (
    user_id TEXT PRIMARY KEY REFERENCES users_local(id) ON DELETE CASCADE,
    preferences_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- Append-only: rows keep the user id that was current when they were written
CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT,
    action TEXT NOT NULL,
    entity_type TEXT,
    entity_id TEXT,
    detail_json TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TRIGGER IF NOT EXISTS audit_logs_no_update
BEFORE UPDATE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_logs_no_delete
BEFORE DELETE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts(user_id);
CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);
CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status, updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_communications_user ON communications(user_id, sent_at DESC);
CREATE INDEX IF NOT EXISTS idx_communications_transaction ON communications(transaction_id);
CREATE INDEX IF NOT EXISTS idx_submissions_transaction ON submissions(transaction_id, status);
CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs(created_at);

CREATE VIEW IF NOT EXISTS transaction_summary AS
SELECT t.id AS transaction_id,
       t.user_id,
       t.property_address,
       t.status,
       (SELECT COUNT(*) FROM transaction_contacts tc WHERE tc.transaction_id = t.id) AS contact_count
FROM transactions t;
";

/// One versioned, transactional schema/data change
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    /// Runs inside the transaction that also bumps the stored version
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Baseline script plus the ordered descriptors layered on top of it
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    pub baseline_sql: &'static str,
    pub baseline_version: i64,
    pub migrations: Vec<Migration>,
}

impl SchemaDefinition {
    pub fn new(baseline_sql: &'static str, baseline_version: i64, migrations: Vec<Migration>) -> Self {
        Self {
            baseline_sql,
            baseline_version,
            migrations,
        }
    }

    /// The schema this crate's host application ships
    pub fn standard() -> Self {
        Self::new(BASELINE_SQL, BASELINE_VERSION, STANDARD_MIGRATIONS.to_vec())
    }

    /// Descriptor versions must sit above the baseline and be unique
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut seen = BTreeSet::new();
        for migration in &self.migrations {
            if migration.version <= self.baseline_version {
                return Err(StoreError::InvalidSchema(format!(
                    "migration v{} ({}) is not above baseline v{}",
                    migration.version, migration.description, self.baseline_version
                )));
            }
            if !seen.insert(migration.version) {
                return Err(StoreError::InvalidSchema(format!(
                    "duplicate migration version v{}",
                    migration.version
                )));
            }
        }
        Ok(())
    }

    /// Descriptors in strictly ascending version order
    pub fn ordered_migrations(&self) -> Vec<Migration> {
        let mut ordered = self.migrations.clone();
        ordered.sort_by_key(|m| m.version);
        ordered
    }

    pub fn latest_version(&self) -> i64 {
        self.migrations
            .iter()
            .map(|m| m.version)
            .max()
            .unwrap_or(self.baseline_version)
            .max(self.baseline_version)
    }
}

pub const STANDARD_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 11,
        description: "add favourite flag to contacts",
        apply: migrate_v11,
    },
    Migration {
        version: 12,
        description: "thread communications",
        apply: migrate_v12,
    },
    Migration {
        version: 13,
        description: "count communications in transaction_summary",
        apply: migrate_v13,
    },
    Migration {
        version: 14,
        description: "backfill closed_at for closed transactions",
        apply: migrate_v14,
    },
];

fn migrate_v11(conn: &Connection) -> rusqlite::Result<()> {
    if !table_has_column(conn, "contacts", "is_favorite")? {
        conn.execute_batch("ALTER TABLE contacts ADD COLUMN is_favorite INTEGER NOT NULL DEFAULT 0;")?;
    }
    Ok(())
}

fn migrate_v12(conn: &Connection) -> rusqlite::Result<()> {
    if !table_has_column(conn, "communications", "thread_id")? {
        conn.execute_batch("ALTER TABLE communications ADD COLUMN thread_id TEXT;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_communications_thread ON communications(thread_id, sent_at);",
    )
}

fn migrate_v13(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
        DROP VIEW IF EXISTS transaction_summary;
        CREATE VIEW transaction_summary AS
        SELECT t.id AS transaction_id,
               t.user_id,
               t.property_address,
               t.status,
               (SELECT COUNT(*) FROM transaction_contacts tc WHERE tc.transaction_id = t.id) AS contact_count,
               (SELECT COUNT(*) FROM communications c WHERE c.transaction_id = t.id) AS communication_count
        FROM transactions t;
        ",
    )
}

fn migrate_v14(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE transactions SET closed_at = updated_at WHERE status = 'closed' AND closed_at IS NULL",
        [],
    )?;
    Ok(())
}

/// Index rebuilt by maintenance; never changes query results
#[derive(Debug, Clone, Copy)]
pub struct PerformanceIndex {
    pub name: &'static str,
    pub create_sql: &'static str,
}

pub const PERFORMANCE_INDEXES: &[PerformanceIndex] = &[
    PerformanceIndex {
        name: "idx_contacts_user",
        create_sql: "CREATE INDEX idx_contacts_user ON contacts(user_id)",
    },
    PerformanceIndex {
        name: "idx_transactions_user",
        create_sql: "CREATE INDEX idx_transactions_user ON transactions(user_id)",
    },
    PerformanceIndex {
        name: "idx_transactions_status",
        create_sql: "CREATE INDEX idx_transactions_status ON transactions(status, updated_at DESC)",
    },
    PerformanceIndex {
        name: "idx_communications_user",
        create_sql: "CREATE INDEX idx_communications_user ON communications(user_id, sent_at DESC)",
    },
    PerformanceIndex {
        name: "idx_communications_transaction",
        create_sql: "CREATE INDEX idx_communications_transaction ON communications(transaction_id)",
    },
    PerformanceIndex {
        name: "idx_submissions_transaction",
        create_sql: "CREATE INDEX idx_submissions_transaction ON submissions(transaction_id, status)",
    },
];

/// Table holding the primary identity row
pub const PRIMARY_IDENTITY_TABLE: &str = "users_local";
pub const PRIMARY_IDENTITY_COLUMN: &str = "id";

/// Tables holding a reference to `users_local.id`.
///
/// Maintained by hand. A new referencing table that is not listed here is
/// not remapped by identifier unification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencingTable {
    Sessions,
    OauthTokens,
    Contacts,
    Transactions,
    Communications,
    Submissions,
    UserPreferences,
}

impl ReferencingTable {
    pub const ALL: [Self; 7] = [
        Self::Sessions,
        Self::OauthTokens,
        Self::Contacts,
        Self::Transactions,
        Self::Communications,
        Self::Submissions,
        Self::UserPreferences,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::OauthTokens => "oauth_tokens",
            Self::Contacts => "contacts",
            Self::Transactions => "transactions",
            Self::Communications => "communications",
            Self::Submissions => "submissions",
            Self::UserPreferences => "user_preferences",
        }
    }

    pub fn column(self) -> &'static str {
        "user_id"
    }
}

pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, bool>(0),
    )
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        params![table, column],
        |row| row.get::<_, bool>(0),
    )
}
