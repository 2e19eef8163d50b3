//! The shared SQLite pool behind the item store and the event log.
//!
//! Every connection handed out is already configured: write-ahead logging
//! so readers never wait on the writer, cascading session deletes via
//! foreign keys, and a busy timeout so concurrent appends queue up instead
//! of failing with `SQLITE_BUSY`.

use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// SQLite knobs taken from the server config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not open the todosync database: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens the pool for the database at `db_path`, creating the file if
/// needed. Migrations are not run here.
///
/// `:memory:` works, but each pooled connection then sees its own empty
/// database, so anything that spans connections needs a real file.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if no connection could be configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::debug!(
        db_path,
        max_size = settings.pool_max_size,
        "database pool ready"
    );
    Ok(pool)
}

fn configure_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    // In-memory databases cannot use WAL and keep "memory".
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stuck at {mode}")),
        ));
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pragma<T: rusqlite::types::FromSql>(conn: &Connection, name: &str) -> T {
        conn.query_row(&format!("PRAGMA {name};"), [], |row| row.get(0))
            .expect("should read pragma")
    }

    #[test]
    fn file_pool_connections_are_configured() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("todosync.db");
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
        };

        let pool = create_pool(path.to_str().expect("utf-8 path"), settings)
            .expect("pool should open");
        assert_eq!(pool.max_size(), 3);

        let conn = pool.get().expect("should get a connection");
        assert_eq!(pragma::<String>(&conn, "journal_mode"), "wal");
        assert_eq!(pragma::<i64>(&conn, "foreign_keys"), 1);
        assert_eq!(pragma::<i64>(&conn, "busy_timeout"), 2_500);
    }

    #[test]
    fn pooled_connections_share_one_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("shared.db");
        let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
            .expect("pool should open");

        let writer = pool.get().expect("writer");
        let reader = pool.get().expect("reader");
        writer
            .execute_batch("CREATE TABLE marks (n INTEGER); INSERT INTO marks VALUES (7);")
            .expect("write");
        assert_eq!(
            reader
                .query_row("SELECT n FROM marks", [], |row| row.get::<_, i64>(0))
                .expect("read through the other connection"),
            7
        );
    }

    #[test]
    fn in_memory_pool_opens() {
        let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool should open");
        let conn = pool.get().expect("should get a connection");
        let mode: String = pragma(&conn, "journal_mode");
        assert!(mode == "wal" || mode == "memory", "unexpected journal_mode: {mode}");
    }
}
