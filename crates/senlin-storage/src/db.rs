//! Database connection management.
//!
//! One database file is shared by every process that works on the same
//! actions: `senlin run` keeps its scheduler's connection open while
//! `senlin submit`, `list` or `cancel` open their own. Each process holds one
//! connection behind a Mutex. Isolation between processes comes from SQLite
//! itself.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use senlin_core::error::SenlinError;
use senlin_core::store::StoreError;

use crate::migrations;

/// How long a writer waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SHARED_FILE_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;";

/// One process's connection to the shared action database.
///
/// In WAL mode readers in other processes are never blocked by the writer.
/// Writers still take turns; a connection that finds the write lock held
/// retries for up to the busy timeout before reporting `SQLITE_BUSY`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// WAL persists in the file, so the first process to open it switches
    /// every later connection over.
    pub fn new(path: &Path) -> Result<Self, SenlinError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| SenlinError::Storage(format!("Failed to open database: {}", e)))?;
        conn.execute_batch(SHARED_FILE_PRAGMAS)
            .map_err(|e| SenlinError::Storage(format!("Failed to set pragmas: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| SenlinError::Storage(format!("Failed to set busy timeout: {}", e)))?;

        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "Action database opened");
        Ok(db)
    }

    /// Open a private in-memory database. Nothing is shared with other
    /// connections.
    pub fn in_memory() -> Result<Self, SenlinError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SenlinError::Storage(format!("Failed to open in-memory db: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SenlinError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Run `f` on this process's connection. Other threads of the process
    /// wait until `f` returns; other processes are only held off by SQLite
    /// locking.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Backend(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
