//! Action lifecycle management.
//!
//! Holds the state machine and an in-memory [`ActionStore`] used for tests
//! and for single-process deployments without a database.

pub mod state_machine;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use senlin_core::store::{ActionFilter, ActionStore, Release, StoreError};
use senlin_core::types::{Action, ActionId, ActionStatus};

#[derive(Default)]
struct Records {
    actions: HashMap<ActionId, Action>,
    /// Insertion sequence, the tie-break for records created in the same instant.
    sequence: HashMap<ActionId, u64>,
    next_sequence: u64,
}

impl Records {
    fn get_mut(&mut self, id: ActionId) -> Result<&mut Action, StoreError> {
        self.actions.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

/// In-memory action store. Every operation runs under one lock, which makes
/// the compare-and-set operations linearizable.
pub struct MemoryActionStore {
    records: Mutex<Records>,
}

impl MemoryActionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Records::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, StoreError> {
        self.records
            .lock()
            .map_err(|e| StoreError::Backend(format!("Lock poisoned: {}", e)))
    }
}

impl Default for MemoryActionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionStore for MemoryActionStore {
    fn get(&self, id: ActionId) -> Result<Action, StoreError> {
        self.lock()?
            .actions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn put_all(&self, actions: &[Action]) -> Result<(), StoreError> {
        let mut stored = self.lock()?;

        for action in actions {
            if stored.actions.contains_key(&action.id) {
                return Err(StoreError::Duplicate(action.id));
            }
        }
        let batch: Vec<ActionId> = actions.iter().map(|a| a.id).collect();
        for action in actions {
            for dep in &action.depends_on {
                if !batch.contains(dep) && !stored.actions.contains_key(dep) {
                    return Err(StoreError::NotFound(*dep));
                }
            }
        }

        for action in actions {
            let seq = stored.next_sequence;
            stored.next_sequence += 1;
            stored.sequence.insert(action.id, seq);
            stored.actions.insert(action.id, action.clone());
        }
        for action in actions {
            for dep in &action.depends_on {
                if let Some(parent) = stored.actions.get_mut(dep) {
                    parent.depended_by.insert(action.id);
                }
            }
        }
        Ok(())
    }

    fn cas_claim(
        &self,
        id: ActionId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        let mut stored = self.lock()?;
        let action = stored.get_mut(id)?;

        if action.owner.is_some() || action.status == ActionStatus::Running {
            return Err(StoreError::AlreadyClaimed(id));
        }
        if action.status != ActionStatus::Ready {
            return Err(StoreError::StatusMismatch {
                id,
                expected: ActionStatus::Ready,
                actual: action.status,
            });
        }

        action.owner = Some(worker_id.to_string());
        action.status = ActionStatus::Running;
        action.claimed_at = Some(now);
        action.cancel_requested = false;
        action.updated_at = now;
        Ok(action.clone())
    }

    fn cas_release(
        &self,
        id: ActionId,
        worker_id: &str,
        release: &Release,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        let mut stored = self.lock()?;
        let action = stored.get_mut(id)?;

        let claim_matches = release.claimed_at.is_none() || release.claimed_at == action.claimed_at;
        if action.owner.as_deref() != Some(worker_id) || !claim_matches {
            return Err(StoreError::OwnershipMismatch {
                id,
                expected: worker_id.to_string(),
                actual: action.owner.clone(),
            });
        }
        if action.status != ActionStatus::Running {
            return Err(StoreError::StatusMismatch {
                id,
                expected: ActionStatus::Running,
                actual: action.status,
            });
        }

        action.owner = None;
        action.claimed_at = None;
        action.cancel_requested = false;
        action.status = release.status;
        action.status_reason = release.status_reason.clone();
        action.retries = release.retries;
        if let Some(outputs) = &release.outputs {
            action.outputs = outputs.clone();
        }
        action.updated_at = now;
        Ok(action.clone())
    }

    fn cas_status(
        &self,
        id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        let mut stored = self.lock()?;
        let action = stored.get_mut(id)?;

        if action.status != from || action.owner.is_some() {
            return Err(StoreError::StatusMismatch {
                id,
                expected: from,
                actual: action.status,
            });
        }

        action.status = to;
        action.status_reason = reason.to_string();
        action.updated_at = now;
        Ok(action.clone())
    }

    fn request_cancel(&self, id: ActionId, now: DateTime<Utc>) -> Result<Action, StoreError> {
        let mut stored = self.lock()?;
        let action = stored.get_mut(id)?;

        if action.status != ActionStatus::Running {
            return Err(StoreError::StatusMismatch {
                id,
                expected: ActionStatus::Running,
                actual: action.status,
            });
        }

        action.cancel_requested = true;
        action.updated_at = now;
        Ok(action.clone())
    }

    fn query(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
        let stored = self.lock()?;
        let mut result: Vec<(u64, Action)> = stored
            .actions
            .values()
            .filter(|a| filter.matches(a))
            .map(|a| (stored.sequence.get(&a.id).copied().unwrap_or(u64::MAX), a.clone()))
            .collect();

        result.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });

        let mut result: Vec<Action> = result.into_iter().map(|(_, action)| action).collect();
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }
}
