//! Schema for items, the per-user event log, and device sessions.
//!
//! The SQL lives in `migrations/*.sql` and is compiled into the binary.
//! `_todosync_migrations` remembers which files have run; a file is applied
//! together with its bookkeeping row in one transaction, so a crash leaves
//! either both or neither.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Applied in this order. Never edit a shipped entry; append a new one.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_items",
        sql: include_str!("migrations/000_items.sql"),
    },
    Migration {
        name: "001_event_log",
        sql: include_str!("migrations/001_event_log.sql"),
    },
    Migration {
        name: "002_sessions",
        sql: include_str!("migrations/002_sessions.sql"),
    },
];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _todosync_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The tracking table could not be read.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the schema up to date and returns how many migrations ran.
///
/// Safe to call on every startup; an up-to-date database is left alone.
///
/// # Errors
///
/// Returns `MigrationError` naming the first migration that failed. Later
/// migrations are not attempted.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(TRACKING_TABLE)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "_todosync_migrations".to_string(),
            source,
        })?;

    let done = applied_names(conn).map_err(MigrationError::StateQuery)?;
    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !done.contains(m.name))
        .collect();
    if pending.is_empty() {
        tracing::debug!(applied = done.len(), "schema is current");
        return Ok(0);
    }

    for migration in &pending {
        tracing::info!(migration = migration.name, "applying migration");
        apply(conn, migration).map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
    }
    Ok(pending.len())
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM _todosync_migrations")?;
    let names = stmt.query_map([], |row| row.get(0))?;
    names.collect()
}

fn apply(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO _todosync_migrations (name) VALUES (?1)",
        [migration.name],
    )?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _todosync_migrations", [], |row| {
                row.get(0)
            })
            .expect("should query migration count");
        assert_eq!(count, MIGRATIONS.len() as i64);

        for table in ["items", "event_streams", "events", "sessions", "event_deliveries"] {
            assert!(table_exists(&conn, table), "{table} table should exist");
        }
    }

    #[test]
    fn second_run_applies_nothing() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");

        let first = run_migrations(&conn).expect("first run should succeed");
        assert_eq!(first, MIGRATIONS.len());

        let second = run_migrations(&conn).expect("second run should succeed");
        assert_eq!(second, 0, "no new migrations to apply");
    }

    #[test]
    fn item_status_check_rejects_unknown_status() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");

        let result = conn.execute(
            "INSERT INTO items (item_id, user_id, status, created_at)
             VALUES ('i1', 'u1', 'done', '2026-01-01T00:00:00.000000Z')",
            [],
        );
        assert!(result.is_err(), "legacy 'done' status must be rejected");
    }

    #[test]
    fn failed_bookkeeping_rolls_back_the_schema_change() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations = [Migration {
            name: "001_tracking_insert_conflict",
            sql: "
                CREATE TABLE half_applied (id INTEGER PRIMARY KEY);
                INSERT INTO _todosync_migrations (name) VALUES ('001_tracking_insert_conflict');
            ",
        }];

        let err = run_migrations_from_list(&conn, &migrations)
            .expect_err("tracking insert conflict should fail migration");

        match err {
            MigrationError::ExecutionFailed { name, .. } => {
                assert_eq!(name, "001_tracking_insert_conflict")
            }
            other => panic!("unexpected error type: {other:?}"),
        }

        assert!(
            !table_exists(&conn, "half_applied"),
            "schema side effects should be rolled back when tracking insert fails"
        );
    }

    #[test]
    fn appended_migrations_run_on_an_existing_database() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("base schema");

        let extra = [Migration {
            name: "900_item_notes",
            sql: "ALTER TABLE items ADD COLUMN note TEXT;",
        }];
        assert_eq!(run_migrations_from_list(&conn, &extra).expect("extra"), 1);
        assert_eq!(run_migrations_from_list(&conn, &extra).expect("rerun"), 0);
        assert_eq!(run_migrations(&conn).expect("base rerun"), 0);
    }
}
