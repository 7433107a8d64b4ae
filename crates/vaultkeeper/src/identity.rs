//! Identifier unification: move a user id, and every reference to it, to a new value

use crate::error::StoreError;
use crate::schema::{table_has_column, ReferencingTable, PRIMARY_IDENTITY_COLUMN, PRIMARY_IDENTITY_TABLE};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRemap {
    pub table: ReferencingTable,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierRemapReport {
    pub primary_rows: usize,
    pub tables: Vec<TableRemap>,
}

impl IdentifierRemapReport {
    pub fn total_rows(&self) -> usize {
        self.primary_rows + self.tables.iter().map(|t| t.rows).sum::<usize>()
    }
}

/// Remap `old_id` to `new_id` across the identity table and every
/// [`ReferencingTable`] in one transaction.
///
/// Foreign keys are switched off for the duration (parent and children
/// disagree mid-update) and switched back on whatever the outcome.
pub fn migrate_identifier(
    conn: &mut Connection,
    old_id: &str,
    new_id: &str,
) -> Result<IdentifierRemapReport, StoreError> {
    if old_id.trim().is_empty() || new_id.trim().is_empty() {
        return Err(StoreError::InvalidIdentifier("identifiers must not be empty".into()));
    }
    if old_id == new_id {
        return Ok(IdentifierRemapReport {
            primary_rows: 0,
            tables: Vec::new(),
        });
    }

    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let result = remap(conn, old_id, new_id);
    let restored = conn.execute_batch("PRAGMA foreign_keys = ON;");

    let report = result?;
    restored?;

    report_violations(conn);
    tracing::info!(rows = report.total_rows(), "identifier unified");
    Ok(report)
}

fn remap(conn: &mut Connection, old_id: &str, new_id: &str) -> Result<IdentifierRemapReport, StoreError> {
    let tx = conn.transaction()?;

    let primary_rows = tx.execute(
        &format!("UPDATE {PRIMARY_IDENTITY_TABLE} SET {PRIMARY_IDENTITY_COLUMN} = ?2 WHERE {PRIMARY_IDENTITY_COLUMN} = ?1"),
        params![old_id, new_id],
    )?;
    if primary_rows == 0 {
        tracing::warn!("no identity row for the old id, remapping references only");
    }

    let mut tables = Vec::with_capacity(ReferencingTable::ALL.len());
    for table in ReferencingTable::ALL {
        if !table_has_column(&tx, table.table_name(), table.column())? {
            tracing::debug!(table = table.table_name(), "no reference column, skipped");
            continue;
        }
        let rows = tx.execute(
            &format!(
                "UPDATE {name} SET {col} = ?2 WHERE {col} = ?1",
                name = table.table_name(),
                col = table.column()
            ),
            params![old_id, new_id],
        )?;
        tracing::info!(table = table.table_name(), rows, "references remapped");
        tables.push(TableRemap { table, rows });
    }

    tx.commit()?;
    Ok(IdentifierRemapReport { primary_rows, tables })
}

fn foreign_key_violations(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

fn report_violations(conn: &Connection) {
    match foreign_key_violations(conn) {
        Ok(tables) if tables.is_empty() => {}
        Ok(tables) => tracing::warn!(count = tables.len(), tables = ?tables, "foreign key violations after remap"),
        Err(e) => tracing::warn!(error = %e, "foreign key check failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BASELINE_SQL;

    const OLD: &str = "local-7f3a";
    const NEW: &str = "cloud-91c2";

    fn seeded() -> anyhow::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(BASELINE_SQL)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(&format!(
            "INSERT INTO users_local (id, email) VALUES ('{OLD}', 'agent@example.com');
             INSERT INTO sessions (id, user_id, token_hash, expires_at) VALUES ('s1', '{OLD}', 'h', '2030-01-01');
             INSERT INTO oauth_tokens (id, user_id, provider) VALUES ('o1', '{OLD}', 'gmail');
             INSERT INTO contacts (id, user_id, display_name) VALUES ('c1', '{OLD}', 'Buyer'), ('c2', '{OLD}', 'Seller');
             INSERT INTO transactions (id, user_id, property_address) VALUES ('t1', '{OLD}', '1 Main St');
             INSERT INTO communications (id, user_id, transaction_id, channel, sent_at) VALUES ('m1', '{OLD}', 't1', 'email', '2024-01-01');
             INSERT INTO submissions (id, user_id, transaction_id) VALUES ('p1', '{OLD}', 't1');
             INSERT INTO user_preferences (user_id) VALUES ('{OLD}');
             INSERT INTO audit_logs (user_id, action) VALUES ('{OLD}', 'login');"
        ))?;
        Ok(conn)
    }

    fn count_with(conn: &Connection, table: ReferencingTable, id: &str) -> anyhow::Result<i64> {
        Ok(conn.query_row(
            &format!("SELECT count(*) FROM {} WHERE {} = ?1", table.table_name(), table.column()),
            params![id],
            |row| row.get(0),
        )?)
    }

    fn foreign_keys_enabled(conn: &Connection) -> anyhow::Result<bool> {
        Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?)
    }

    #[test]
    fn remaps_every_referencing_table() -> anyhow::Result<()> {
        let mut conn = seeded()?;
        let report = migrate_identifier(&mut conn, OLD, NEW)?;

        assert_eq!(report.primary_rows, 1);
        assert_eq!(report.tables.len(), ReferencingTable::ALL.len());
        assert_eq!(report.total_rows(), 9);
        for table in ReferencingTable::ALL {
            assert_eq!(count_with(&conn, table, OLD)?, 0, "{}", table.table_name());
            assert!(count_with(&conn, table, NEW)? > 0, "{}", table.table_name());
        }
        let audit_old: i64 = conn.query_row(
            "SELECT count(*) FROM audit_logs WHERE user_id = ?1",
            params![OLD],
            |row| row.get(0),
        )?;
        assert_eq!(audit_old, 1);
        assert!(foreign_keys_enabled(&conn)?);
        Ok(())
    }

    #[test]
    fn failure_on_last_table_rolls_everything_back() -> anyhow::Result<()> {
        let mut conn = seeded()?;
        conn.execute_batch(
            "CREATE TRIGGER prefs_locked BEFORE UPDATE ON user_preferences
             BEGIN SELECT RAISE(ABORT, 'preferences locked'); END;",
        )?;

        let err = migrate_identifier(&mut conn, OLD, NEW).err();
        assert!(matches!(err, Some(StoreError::Sqlite(_))));

        let users_new: i64 = conn.query_row(
            "SELECT count(*) FROM users_local WHERE id = ?1",
            params![NEW],
            |row| row.get(0),
        )?;
        assert_eq!(users_new, 0);
        for table in ReferencingTable::ALL {
            assert_eq!(count_with(&conn, table, NEW)?, 0, "{}", table.table_name());
        }
        assert!(foreign_keys_enabled(&conn)?);
        Ok(())
    }

    #[test]
    fn rejects_empty_and_skips_identical_ids() -> anyhow::Result<()> {
        let mut conn = seeded()?;
        assert!(matches!(
            migrate_identifier(&mut conn, "", NEW),
            Err(StoreError::InvalidIdentifier(_))
        ));
        let report = migrate_identifier(&mut conn, OLD, OLD)?;
        assert_eq!(report.total_rows(), 0);
        Ok(())
    }

    #[test]
    fn missing_identity_row_still_moves_references() -> anyhow::Result<()> {
        let mut conn = seeded()?;
        conn.execute_batch("PRAGMA foreign_keys = OFF; DELETE FROM users_local; PRAGMA foreign_keys = ON;")?;

        let report = migrate_identifier(&mut conn, OLD, NEW)?;
        assert_eq!(report.primary_rows, 0);
        assert_eq!(count_with(&conn, ReferencingTable::Contacts, NEW)?, 2);
        Ok(())
    }
}
