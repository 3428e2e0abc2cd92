//! Database schema migrations.
//!
//! Applies the action record schema and tracks applied versions in the
//! schema_migrations table.

use rusqlite::Connection;
use tracing::info;

use senlin_core::store::StoreError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    // Create the migrations tracking table first.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| StoreError::Backend(format!("Failed to create migrations table: {}", e)))?;

    let current_version = current_version(conn)?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: actions");
    }

    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: cancel_requested");
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Backend(format!("Failed to query migration version: {}", e)))
}

/// Version 1: action records.
///
/// Timestamps are microseconds since the Unix epoch. Structured fields
/// (`inputs`, `outputs`, `depends_on`, `depended_by`) are JSON text.
fn apply_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS actions (
            id              TEXT PRIMARY KEY NOT NULL,
            description     TEXT NOT NULL DEFAULT '',
            target          TEXT NOT NULL,
            target_kind     TEXT NOT NULL
                            CHECK (target_kind IN ('cluster', 'node', 'policy')),
            verb            TEXT NOT NULL,
            cause           TEXT,
            owner           TEXT,
            interval        INTEGER NOT NULL DEFAULT -1,
            start_time      TEXT NOT NULL DEFAULT '',
            end_time        INTEGER,
            timeout         INTEGER NOT NULL,
            status          TEXT NOT NULL
                            CHECK (status IN ('INIT', 'WAITING', 'READY', 'RUNNING',
                                              'SUCCEEDED', 'FAILED', 'CANCELLED')),
            status_reason   TEXT NOT NULL DEFAULT '',
            inputs          TEXT NOT NULL DEFAULT '{}',
            outputs         TEXT NOT NULL DEFAULT '{}',
            depends_on      TEXT NOT NULL DEFAULT '[]',
            depended_by     TEXT NOT NULL DEFAULT '[]',
            retries         INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            claimed_at      INTEGER,
            CHECK (owner IS NULL OR status = 'RUNNING')
        );

        CREATE INDEX IF NOT EXISTS idx_actions_status
            ON actions (status, created_at, id);

        CREATE INDEX IF NOT EXISTS idx_actions_target
            ON actions (target, created_at, id);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'actions');

        COMMIT;
        ",
    )
    .map_err(|e| StoreError::Backend(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}

/// Version 2: cancellation requests for RUNNING actions, visible to every
/// process sharing the database.
fn apply_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;

        ALTER TABLE actions
            ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0
            CHECK (cancel_requested = 0 OR status = 'RUNNING');

        INSERT INTO schema_migrations (version, name) VALUES (2, 'cancel_requested');

        COMMIT;
        ",
    )
    .map_err(|e| StoreError::Backend(format!("Migration v2 failed: {}", e)))?;

    Ok(())
}
