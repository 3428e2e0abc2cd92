//! The action record store interface.
//!
//! The store is the single source of truth for action records. Every
//! `owner`/`status` mutation goes through one of the compare-and-set
//! operations below, which implementations must make linearizable.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Action, ActionId, ActionStatus, Params};

/// Errors returned by [`ActionStore`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Action not found: {0}")]
    NotFound(ActionId),

    #[error("Action already exists: {0}")]
    Duplicate(ActionId),

    #[error("Action {0} is already claimed")]
    AlreadyClaimed(ActionId),

    #[error("Action {id} is owned by {actual:?}, not {expected}")]
    OwnershipMismatch {
        id: ActionId,
        expected: String,
        actual: Option<String>,
    },

    #[error("Action {id} is {actual}, expected {expected}")]
    StatusMismatch {
        id: ActionId,
        expected: ActionStatus,
        actual: ActionStatus,
    },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Selection criteria for [`ActionStore::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub target: Option<String>,
    pub limit: Option<usize>,
}

impl ActionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, action: &Action) -> bool {
        if let Some(status) = self.status {
            if action.status != status {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if &action.target != target {
                return false;
            }
        }
        true
    }
}

/// Fields written when an owner gives up a RUNNING action.
///
/// The owner is always cleared by a release.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub status: ActionStatus,
    pub status_reason: String,
    /// Replaces the stored outputs when set.
    pub outputs: Option<Params>,
    pub retries: u32,
    /// When set, the release applies only to the claim made at this instant.
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Durable keyed storage for action records.
pub trait ActionStore: Send + Sync {
    /// Fetch one record.
    fn get(&self, id: ActionId) -> Result<Action, StoreError>;

    /// Insert new records atomically.
    ///
    /// Fails with `Duplicate` if any id already exists, or `NotFound` if a
    /// dependency is neither in the batch nor stored; nothing is written in
    /// either case. For every `depends_on` entry that refers to a record
    /// outside the batch, the new id is added to that record's `depended_by`
    /// in the same step.
    fn put_all(&self, actions: &[Action]) -> Result<(), StoreError>;

    /// Insert a single new record.
    fn put(&self, action: &Action) -> Result<(), StoreError> {
        self.put_all(std::slice::from_ref(action))
    }

    /// Atomically move a READY, unowned action to RUNNING under `worker_id`.
    ///
    /// Clears `cancel_requested`.
    fn cas_claim(
        &self,
        id: ActionId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError>;

    /// Atomically apply `release` to a RUNNING action owned by `worker_id`.
    ///
    /// Clears `cancel_requested`.
    fn cas_release(
        &self,
        id: ActionId,
        worker_id: &str,
        release: &Release,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError>;

    /// Atomically move an unowned action from `from` to `to`.
    fn cas_status(
        &self,
        id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError>;

    /// Atomically set `cancel_requested` on a RUNNING action.
    ///
    /// Fails with `StatusMismatch` if the action is not RUNNING. The owner
    /// and status are left alone.
    fn request_cancel(&self, id: ActionId, now: DateTime<Utc>) -> Result<Action, StoreError>;

    /// Records matching `filter`, oldest first by creation time, then in
    /// insertion order.
    fn query(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StartTime, TargetKind, Verb, RUN_ONCE};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn action(target: &str, status: ActionStatus) -> Action {
        let now = Utc::now();
        Action {
            id: Uuid::new_v4(),
            description: String::new(),
            target: target.to_string(),
            target_kind: TargetKind::Node,
            action: Verb::Join,
            cause: None,
            owner: None,
            interval: RUN_ONCE,
            start_time: StartTime::Immediate,
            end_time: None,
            timeout: 30,
            status,
            status_reason: String::new(),
            inputs: Params::new(),
            outputs: Params::new(),
            depends_on: BTreeSet::new(),
            depended_by: BTreeSet::new(),
            retries: 0,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            cancel_requested: false,
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ActionFilter::new();
        assert!(filter.matches(&action("node-1", ActionStatus::Ready)));
        assert!(filter.matches(&action("node-2", ActionStatus::Failed)));
    }

    #[test]
    fn test_filter_by_status_and_target() {
        let filter = ActionFilter::new()
            .with_status(ActionStatus::Ready)
            .with_target("node-1");
        assert!(filter.matches(&action("node-1", ActionStatus::Ready)));
        assert!(!filter.matches(&action("node-1", ActionStatus::Waiting)));
        assert!(!filter.matches(&action("node-2", ActionStatus::Ready)));
    }

    #[test]
    fn test_store_error_display() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let err = StoreError::StatusMismatch {
            id,
            expected: ActionStatus::Ready,
            actual: ActionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Action 550e8400-e29b-41d4-a716-446655440000 is RUNNING, expected READY"
        );

        let err = StoreError::OwnershipMismatch {
            id,
            expected: "worker-2".to_string(),
            actual: Some("worker-1".to_string()),
        };
        assert!(err.to_string().contains("worker-2"));
        assert!(err.to_string().contains("worker-1"));
    }
}
