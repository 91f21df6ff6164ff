//! Shared database connection.
//!
//! The sidecar funnels all writes through the sink workers and the
//! dashboard reads are sparse, so one mutex-guarded connection covers the
//! whole process. WAL mode keeps the occasional dashboard read from
//! stalling behind a writer, and the busy timeout absorbs the rest.

use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{Result, StorageError};
use crate::schema::run_migrations;

/// Applied to every fresh connection before migrations run.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Handle to the process-wide SQLite connection.
///
/// Clones share the same underlying connection; `lock` serialises access.
#[derive(Clone)]
pub struct DbConn {
    inner: Arc<Mutex<Connection>>,
}

impl DbConn {
    /// Opens (creating if needed) a file-backed database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Opens a private in-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        run_migrations(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection for a sequence of statements.
    ///
    /// Hold the guard only for the statements themselves; event assembly
    /// and serialisation happen before calling in.
    pub fn lock(&self) -> Result<ConnGuard<'_>> {
        self.inner
            .lock()
            .map(|guard| ConnGuard { guard })
            .map_err(|_| StorageError::Config("database mutex poisoned".to_string()))
    }
}

/// Exclusive access to the connection for the guard's lifetime.
pub struct ConnGuard<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl Deref for ConnGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_device(conn: &DbConn, id: &str) {
        let guard = conn.lock().unwrap();
        guard
            .execute(
                "INSERT INTO devices (id, first_seen, last_updated) VALUES (?1, ?2, ?2)",
                rusqlite::params![id, "2026-01-01T00:00:00Z"],
            )
            .unwrap();
    }

    fn device_count(conn: &DbConn) -> i64 {
        let guard = conn.lock().unwrap();
        guard
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn open_in_memory_applies_schema() {
        let conn = DbConn::open_in_memory().unwrap();
        let guard = conn.lock().unwrap();
        let events: i64 = guard
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(events, 0);
    }

    #[test]
    fn clones_see_the_same_database() {
        let conn = DbConn::open_in_memory().unwrap();
        let other = conn.clone();

        insert_device(&other, "written-through-clone");
        assert_eq!(device_count(&conn), 1);
    }

    #[test]
    fn concurrent_writers_are_serialised() {
        let conn = DbConn::open_in_memory().unwrap();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let conn = conn.clone();
                std::thread::spawn(move || insert_device(&conn, &format!("device-{i}")))
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(device_count(&conn), 8);
    }

    #[test]
    fn guard_releases_between_uses() {
        let conn = DbConn::open_in_memory().unwrap();
        insert_device(&conn, "a");
        insert_device(&conn, "b");
        assert_eq!(device_count(&conn), 2);
    }
}
