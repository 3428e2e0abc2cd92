//! Value objects used at the engine boundary.
//!
//! `ActionSpec` is what the external layer hands to the engine when it wants
//! an action recorded; `Outcome` and `DispatchResult` are what operation
//! handlers hand back.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use senlin_core::types::{
    Action, ActionId, ActionStatus, Params, StartTime, TargetKind, Verb, RUN_ONCE,
};

use crate::error::EngineError;

// =============================================================================
// Action specification
// =============================================================================

/// Everything fixed at creation time for a new action.
///
/// The id is assigned by [`ActionSpec::new`] so that several specs can
/// reference each other in `depends_on` before they are registered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: ActionId,
    pub description: String,
    pub target: String,
    pub target_kind: TargetKind,
    pub action: Verb,
    pub cause: Option<ActionId>,
    pub interval: i64,
    pub start_time: StartTime,
    pub end_time: Option<DateTime<Utc>>,
    /// Ownership timeout in seconds; the engine default applies when unset.
    pub timeout: Option<u64>,
    pub inputs: Params,
    pub depends_on: BTreeSet<ActionId>,
}

impl ActionSpec {
    pub fn new(target_kind: TargetKind, target: impl Into<String>, action: Verb) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: String::new(),
            target: target.into(),
            target_kind,
            action,
            cause: None,
            interval: RUN_ONCE,
            start_time: StartTime::Immediate,
            end_time: None,
            timeout: None,
            inputs: Params::new(),
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_cause(mut self, cause: ActionId) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_interval(mut self, seconds: i64) -> Self {
        self.interval = seconds;
        self
    }

    pub fn with_start_time(mut self, start_time: StartTime) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: Params) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn depends_on(mut self, id: ActionId) -> Self {
        self.depends_on.insert(id);
        self
    }

    /// Field-level checks that need no knowledge of other actions.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.target.trim().is_empty() {
            return Err(EngineError::Validation(
                "target must not be empty".to_string(),
            ));
        }
        if self.interval < RUN_ONCE {
            return Err(EngineError::Validation(format!(
                "interval must be -1 or a non-negative number of seconds, got {}",
                self.interval
            )));
        }
        if self.timeout == Some(0) {
            return Err(EngineError::Validation(
                "timeout must be at least one second".to_string(),
            ));
        }
        if self.depends_on.contains(&self.id) {
            return Err(EngineError::CycleDetected(self.id));
        }
        if self.cause == Some(self.id) {
            return Err(EngineError::Validation(
                "an action cannot be its own cause".to_string(),
            ));
        }
        if self.start_time.reference() == Some(self.id) {
            return Err(EngineError::Validation(
                "start time cannot reference the action itself".to_string(),
            ));
        }
        if let (StartTime::At(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(EngineError::Validation(format!(
                    "end time {} is not after start time {}",
                    end, start
                )));
            }
        }
        Ok(())
    }

    /// Materialize the record in INIT status.
    pub(crate) fn into_action(self, default_timeout: u64, now: DateTime<Utc>) -> Action {
        Action {
            id: self.id,
            description: self.description,
            target: self.target,
            target_kind: self.target_kind,
            action: self.action,
            cause: self.cause,
            owner: None,
            interval: self.interval,
            start_time: self.start_time,
            end_time: self.end_time,
            timeout: self.timeout.unwrap_or(default_timeout),
            status: ActionStatus::Init,
            status_reason: String::new(),
            inputs: self.inputs,
            outputs: Params::new(),
            depends_on: self.depends_on,
            depended_by: BTreeSet::new(),
            retries: 0,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            cancel_requested: false,
        }
    }
}

// =============================================================================
// Handler results
// =============================================================================

/// What an operation reports back for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Ok,
    Failed,
    Retry,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "OK"),
            Outcome::Failed => write!(f, "FAILED"),
            Outcome::Retry => write!(f, "RETRY"),
        }
    }
}

/// Result of dispatching one action to its operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub outcome: Outcome,
    pub outputs: Params,
    pub reason: String,
}

impl DispatchResult {
    pub fn ok(outputs: Params) -> Self {
        Self {
            outcome: Outcome::Ok,
            outputs,
            reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            outputs: Params::new(),
            reason: reason.into(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Retry,
            outputs: Params::new(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_defaults() {
        let spec = ActionSpec::new(TargetKind::Cluster, "cluster-a", Verb::Create);
        assert_eq!(spec.interval, RUN_ONCE);
        assert_eq!(spec.start_time, StartTime::Immediate);
        assert!(spec.depends_on.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_builder() {
        let dep = Uuid::new_v4();
        let spec = ActionSpec::new(TargetKind::Node, "node-1", Verb::Join)
            .with_description("join node-1")
            .with_input("cluster", json!("cluster-a"))
            .with_timeout(120)
            .with_interval(30)
            .depends_on(dep);

        assert_eq!(spec.description, "join node-1");
        assert_eq!(spec.inputs["cluster"], json!("cluster-a"));
        assert_eq!(spec.timeout, Some(120));
        assert_eq!(spec.interval, 30);
        assert!(spec.depends_on.contains(&dep));
    }

    #[test]
    fn test_validate_rejects_empty_target() {
        let spec = ActionSpec::new(TargetKind::Node, "  ", Verb::Create);
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_bad_interval_and_timeout() {
        let spec = ActionSpec::new(TargetKind::Node, "n", Verb::Create).with_interval(-2);
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));

        let spec = ActionSpec::new(TargetKind::Node, "n", Verb::Create).with_timeout(0);
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_self_dependency_as_cycle() {
        let spec = ActionSpec::new(TargetKind::Cluster, "c", Verb::Update);
        let id = spec.id;
        let spec = spec.depends_on(id);
        assert!(matches!(spec.validate(), Err(EngineError::CycleDetected(found)) if found == id));
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let start = Utc::now();
        let spec = ActionSpec::new(TargetKind::Policy, "p", Verb::Enable)
            .with_start_time(StartTime::At(start))
            .with_end_time(start - chrono::Duration::seconds(5));
        assert!(matches!(spec.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_into_action_applies_default_timeout() {
        let now = Utc::now();
        let spec = ActionSpec::new(TargetKind::Cluster, "c", Verb::Delete);
        let id = spec.id;
        let action = spec.into_action(3600, now);
        assert_eq!(action.id, id);
        assert_eq!(action.timeout, 3600);
        assert_eq!(action.status, ActionStatus::Init);
        assert!(action.owner.is_none());
        assert_eq!(action.created_at, now);
    }

    #[test]
    fn test_dispatch_result_constructors() {
        assert_eq!(DispatchResult::ok(Params::new()).outcome, Outcome::Ok);
        let failed = DispatchResult::failed("boom");
        assert_eq!(failed.outcome, Outcome::Failed);
        assert_eq!(failed.reason, "boom");
        assert_eq!(DispatchResult::retry("busy").outcome, Outcome::Retry);
        assert_eq!(Outcome::Retry.to_string(), "RETRY");
    }
}
