//! SQLite-backed action store.
//!
//! Every compare-and-set is one conditional `UPDATE`; when it touches no
//! row the current record is read back to report why. Ties on `created_at`
//! are broken by `rowid`, i.e. insertion order.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use senlin_core::error::SenlinError;
use senlin_core::store::{ActionFilter, ActionStore, Release, StoreError};
use senlin_core::types::{Action, ActionId, ActionStatus, Params};

use crate::db::Database;

const ACTION_COLUMNS: &str = "id, description, target, target_kind, verb, cause, owner, interval,
     start_time, end_time, timeout, status, status_reason, inputs, outputs, depends_on,
     depended_by, retries, created_at, updated_at, claimed_at, cancel_requested";

/// Durable [`ActionStore`] on SQLite.
pub struct SqliteActionStore {
    db: Arc<Database>,
}

impl SqliteActionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, SenlinError> {
        Ok(Self::new(Arc::new(Database::new(path)?)))
    }

    /// A store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, SenlinError> {
        Ok(Self::new(Arc::new(Database::in_memory()?)))
    }

    /// Explain why a conditional update matched no row.
    fn diagnose(
        conn: &Connection,
        id: ActionId,
        expected: ActionStatus,
        worker_id: Option<&str>,
    ) -> StoreError {
        let current = match find(conn, id) {
            Ok(Some(action)) => action,
            Ok(None) => return StoreError::NotFound(id),
            Err(e) => return e,
        };
        match worker_id {
            None if current.owner.is_some() || current.status == ActionStatus::Running => {
                StoreError::AlreadyClaimed(id)
            }
            Some(worker) if current.owner.as_deref() != Some(worker) => {
                StoreError::OwnershipMismatch {
                    id,
                    expected: worker.to_string(),
                    actual: current.owner,
                }
            }
            _ if current.status != expected => StoreError::StatusMismatch {
                id,
                expected,
                actual: current.status,
            },
            // Owner and status match, so only the claim time can differ.
            Some(worker) => StoreError::OwnershipMismatch {
                id,
                expected: worker.to_string(),
                actual: current.owner,
            },
            None => StoreError::StatusMismatch {
                id,
                expected,
                actual: current.status,
            },
        }
    }
}

impl ActionStore for SqliteActionStore {
    fn get(&self, id: ActionId) -> Result<Action, StoreError> {
        self.db
            .with_conn(|conn| find(conn, id)?.ok_or(StoreError::NotFound(id)))
    }

    fn put_all(&self, actions: &[Action]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| StoreError::Backend(format!("Failed to begin transaction: {}", e)))?;

            let batch: HashSet<ActionId> = actions.iter().map(|a| a.id).collect();
            for action in actions {
                if exists(&tx, action.id)? {
                    return Err(StoreError::Duplicate(action.id));
                }
                for dep in &action.depends_on {
                    if !batch.contains(dep) && !exists(&tx, *dep)? {
                        return Err(StoreError::NotFound(*dep));
                    }
                }
            }

            for action in actions {
                insert(&tx, action)?;
            }
            for action in actions {
                for dep in &action.depends_on {
                    if let Some(mut parent) = find(&tx, *dep)? {
                        parent.depended_by.insert(action.id);
                        tx.execute(
                            "UPDATE actions SET depended_by = ?2 WHERE id = ?1",
                            rusqlite::params![dep.to_string(), to_json(&parent.depended_by)?],
                        )
                        .map_err(|e| {
                            StoreError::Backend(format!("Failed to link dependency: {}", e))
                        })?;
                    }
                }
            }

            // Dropping `tx` on an early return above rolls everything back.
            tx.commit()
                .map_err(|e| StoreError::Backend(format!("Failed to commit actions: {}", e)))
        })
    }

    fn cas_claim(
        &self,
        id: ActionId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        self.db.with_conn(|conn| {
            let now = to_micros(now);
            let changed = conn
                .execute(
                    "UPDATE actions
                     SET owner = ?2, status = 'RUNNING', claimed_at = ?3, updated_at = ?3,
                         cancel_requested = 0
                     WHERE id = ?1 AND status = 'READY' AND owner IS NULL",
                    rusqlite::params![id.to_string(), worker_id, now],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to claim action: {}", e)))?;

            if changed == 0 {
                return Err(Self::diagnose(conn, id, ActionStatus::Ready, None));
            }
            find(conn, id)?.ok_or(StoreError::NotFound(id))
        })
    }

    fn cas_release(
        &self,
        id: ActionId,
        worker_id: &str,
        release: &Release,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        self.db.with_conn(|conn| {
            let outputs = release.outputs.as_ref().map(to_json).transpose()?;
            let changed = conn
                .execute(
                    "UPDATE actions
                     SET owner = NULL, claimed_at = NULL, cancel_requested = 0, status = ?3,
                         status_reason = ?4, retries = ?5, outputs = COALESCE(?6, outputs),
                         updated_at = ?7
                     WHERE id = ?1 AND owner = ?2 AND status = 'RUNNING'
                       AND (?8 IS NULL OR claimed_at = ?8)",
                    rusqlite::params![
                        id.to_string(),
                        worker_id,
                        release.status.as_str(),
                        release.status_reason,
                        release.retries,
                        outputs,
                        to_micros(now),
                        release.claimed_at.map(to_micros),
                    ],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to release action: {}", e)))?;

            if changed == 0 {
                return Err(Self::diagnose(
                    conn,
                    id,
                    ActionStatus::Running,
                    Some(worker_id),
                ));
            }
            find(conn, id)?.ok_or(StoreError::NotFound(id))
        })
    }

    fn cas_status(
        &self,
        id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE actions
                     SET status = ?3, status_reason = ?4, updated_at = ?5
                     WHERE id = ?1 AND status = ?2 AND owner IS NULL",
                    rusqlite::params![
                        id.to_string(),
                        from.as_str(),
                        to.as_str(),
                        reason,
                        to_micros(now),
                    ],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to update status: {}", e)))?;

            if changed == 0 {
                let current = find(conn, id)?.ok_or(StoreError::NotFound(id))?;
                return Err(StoreError::StatusMismatch {
                    id,
                    expected: from,
                    actual: current.status,
                });
            }
            find(conn, id)?.ok_or(StoreError::NotFound(id))
        })
    }

    fn request_cancel(&self, id: ActionId, now: DateTime<Utc>) -> Result<Action, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE actions
                     SET cancel_requested = 1, updated_at = ?2
                     WHERE id = ?1 AND status = 'RUNNING'",
                    rusqlite::params![id.to_string(), to_micros(now)],
                )
                .map_err(|e| StoreError::Backend(format!("Failed to request cancel: {}", e)))?;

            if changed == 0 {
                let current = find(conn, id)?.ok_or(StoreError::NotFound(id))?;
                return Err(StoreError::StatusMismatch {
                    id,
                    expected: ActionStatus::Running,
                    actual: current.status,
                });
            }
            find(conn, id)?.ok_or(StoreError::NotFound(id))
        })
    }

    fn query(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM actions
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR target = ?2)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?3",
                ACTION_COLUMNS
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let limit = filter
                .limit
                .and_then(|l| i64::try_from(l).ok())
                .unwrap_or(-1);
            let rows = stmt
                .query_map(
                    rusqlite::params![filter.status.map(|s| s.as_str()), filter.target, limit],
                    |row| Ok(row_to_action(row)),
                )
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let mut actions = Vec::new();
            for row in rows {
                let action = row.map_err(|e| StoreError::Backend(e.to_string()))??;
                actions.push(action);
            }
            Ok(actions)
        })
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn exists(conn: &Connection, id: ActionId) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT 1 FROM actions WHERE id = ?1",
        rusqlite::params![id.to_string()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| StoreError::Backend(e.to_string()))
}

fn find(conn: &Connection, id: ActionId) -> Result<Option<Action>, StoreError> {
    let sql = format!("SELECT {} FROM actions WHERE id = ?1", ACTION_COLUMNS);
    let result = conn
        .query_row(&sql, rusqlite::params![id.to_string()], |row| {
            Ok(row_to_action(row))
        })
        .optional()
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    result.transpose()
}

fn insert(conn: &Connection, action: &Action) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO actions ({})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20, ?21, ?22)",
        ACTION_COLUMNS
    );
    conn.execute(
        &sql,
        rusqlite::params![
            action.id.to_string(),
            action.description,
            action.target,
            action.target_kind.to_string(),
            action.action.as_str(),
            action.cause.map(|c| c.to_string()),
            action.owner,
            action.interval,
            action.start_time.to_string(),
            action.end_time.map(to_micros),
            i64::try_from(action.timeout).unwrap_or(i64::MAX),
            action.status.as_str(),
            action.status_reason,
            to_json(&action.inputs)?,
            to_json(&action.outputs)?,
            to_json(&action.depends_on)?,
            to_json(&action.depended_by)?,
            action.retries,
            to_micros(action.created_at),
            to_micros(action.updated_at),
            action.claimed_at.map(to_micros),
            action.cancel_requested,
        ],
    )
    .map_err(|e| StoreError::Backend(format!("Failed to insert action {}: {}", action.id, e)))?;
    Ok(())
}

fn row_to_action(row: &rusqlite::Row) -> Result<Action, StoreError> {
    let get_err = |e: rusqlite::Error| StoreError::Backend(e.to_string());

    let id: String = row.get(0).map_err(get_err)?;
    let target_kind: String = row.get(3).map_err(get_err)?;
    let verb: String = row.get(4).map_err(get_err)?;
    let cause: Option<String> = row.get(5).map_err(get_err)?;
    let start_time: String = row.get(8).map_err(get_err)?;
    let end_time: Option<i64> = row.get(9).map_err(get_err)?;
    let timeout: i64 = row.get(10).map_err(get_err)?;
    let status: String = row.get(11).map_err(get_err)?;
    let inputs: String = row.get(13).map_err(get_err)?;
    let outputs: String = row.get(14).map_err(get_err)?;
    let depends_on: String = row.get(15).map_err(get_err)?;
    let depended_by: String = row.get(16).map_err(get_err)?;
    let created_at: i64 = row.get(18).map_err(get_err)?;
    let updated_at: i64 = row.get(19).map_err(get_err)?;
    let claimed_at: Option<i64> = row.get(20).map_err(get_err)?;

    Ok(Action {
        id: parse_id(&id)?,
        description: row.get(1).map_err(get_err)?,
        target: row.get(2).map_err(get_err)?,
        target_kind: target_kind.parse().map_err(StoreError::Backend)?,
        action: verb.parse().map_err(StoreError::Backend)?,
        cause: cause.as_deref().map(parse_id).transpose()?,
        owner: row.get(6).map_err(get_err)?,
        interval: row.get(7).map_err(get_err)?,
        start_time: start_time.parse().map_err(StoreError::Backend)?,
        end_time: end_time.map(from_micros).transpose()?,
        timeout: u64::try_from(timeout).unwrap_or(0),
        status: status.parse().map_err(StoreError::Backend)?,
        status_reason: row.get(12).map_err(get_err)?,
        inputs: from_json::<Params>(&inputs)?,
        outputs: from_json::<Params>(&outputs)?,
        depends_on: from_json::<BTreeSet<ActionId>>(&depends_on)?,
        depended_by: from_json::<BTreeSet<ActionId>>(&depended_by)?,
        retries: row.get(17).map_err(get_err)?,
        created_at: from_micros(created_at)?,
        updated_at: from_micros(updated_at)?,
        claimed_at: claimed_at.map(from_micros).transpose()?,
        cancel_requested: row.get(21).map_err(get_err)?,
    })
}

fn parse_id(s: &str) -> Result<ActionId, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("Invalid action id '{}': {}", s, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Backend(format!("Corrupt JSON column: {}", e)))
}

fn to_micros(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| StoreError::Backend(format!("Invalid timestamp: {}", micros)))
}
