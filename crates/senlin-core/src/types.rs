//! Core domain types for the action engine.
//!
//! Defines the action record, its status lifecycle, the closed verb sets per
//! target kind, and the scheduling predicates used for `start_time`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an action record.
pub type ActionId = Uuid;

/// Structured parameters passed into and produced by an action.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Interval value meaning "execute once".
pub const RUN_ONCE: i64 = -1;

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle states of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Init,
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 7] = [
        ActionStatus::Init,
        ActionStatus::Waiting,
        ActionStatus::Ready,
        ActionStatus::Running,
        ActionStatus::Succeeded,
        ActionStatus::Failed,
        ActionStatus::Cancelled,
    ];

    /// SUCCEEDED, FAILED and CANCELLED admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Init => "INIT",
            ActionStatus::Waiting => "WAITING",
            ActionStatus::Ready => "READY",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Succeeded => "SUCCEEDED",
            ActionStatus::Failed => "FAILED",
            ActionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown action status: {}", s))
    }
}

/// Kind of entity an action operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Cluster,
    Node,
    Policy,
}

impl TargetKind {
    pub const ALL: [TargetKind; 3] = [TargetKind::Cluster, TargetKind::Node, TargetKind::Policy];

    /// The closed verb set accepted for this kind.
    pub fn verbs(self) -> &'static [Verb] {
        match self {
            TargetKind::Cluster => &[
                Verb::Create,
                Verb::Delete,
                Verb::AddNode,
                Verb::DelNode,
                Verb::Update,
                Verb::AttachPolicy,
                Verb::DetachPolicy,
            ],
            TargetKind::Node => &[
                Verb::Create,
                Verb::Delete,
                Verb::Update,
                Verb::Join,
                Verb::Leave,
            ],
            TargetKind::Policy => &[Verb::Enable, Verb::Disable, Verb::Update],
        }
    }

    pub fn supports(self, verb: Verb) -> bool {
        self.verbs().contains(&verb)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Cluster => write!(f, "cluster"),
            TargetKind::Node => write!(f, "node"),
            TargetKind::Policy => write!(f, "policy"),
        }
    }
}

impl FromStr for TargetKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" => Ok(TargetKind::Cluster),
            "node" => Ok(TargetKind::Node),
            "policy" => Ok(TargetKind::Policy),
            _ => Err(format!("Unknown target kind: {}", s)),
        }
    }
}

/// Operation verbs across all target kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    Create,
    Delete,
    AddNode,
    DelNode,
    Update,
    AttachPolicy,
    DetachPolicy,
    Join,
    Leave,
    Enable,
    Disable,
}

impl Verb {
    pub const ALL: [Verb; 11] = [
        Verb::Create,
        Verb::Delete,
        Verb::AddNode,
        Verb::DelNode,
        Verb::Update,
        Verb::AttachPolicy,
        Verb::DetachPolicy,
        Verb::Join,
        Verb::Leave,
        Verb::Enable,
        Verb::Disable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "CREATE",
            Verb::Delete => "DELETE",
            Verb::AddNode => "ADD_NODE",
            Verb::DelNode => "DEL_NODE",
            Verb::Update => "UPDATE",
            Verb::AttachPolicy => "ATTACH_POLICY",
            Verb::DetachPolicy => "DETACH_POLICY",
            Verb::Join => "JOIN",
            Verb::Leave => "LEAVE",
            Verb::Enable => "ENABLE",
            Verb::Disable => "DISABLE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown verb: {}", s))
    }
}

/// When an action becomes eligible to run.
///
/// Text form: an RFC 3339 timestamp, `AFTER: <id>` or `WHEN: <id> <STATUS>`.
/// An empty string means `Immediate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StartTime {
    #[default]
    Immediate,
    /// Not before the given instant.
    At(DateTime<Utc>),
    /// Once the referenced action reaches any terminal status.
    After(ActionId),
    /// Once the referenced action reaches the given status.
    When(ActionId, ActionStatus),
}

impl StartTime {
    /// The action this predicate waits on, if any.
    pub fn reference(&self) -> Option<ActionId> {
        match self {
            StartTime::After(id) | StartTime::When(id, _) => Some(*id),
            StartTime::Immediate | StartTime::At(_) => None,
        }
    }
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartTime::Immediate => Ok(()),
            StartTime::At(at) => write!(f, "{}", at.to_rfc3339()),
            StartTime::After(id) => write!(f, "AFTER: {}", id),
            StartTime::When(id, status) => write!(f, "WHEN: {} {}", id, status),
        }
    }
}

impl FromStr for StartTime {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(StartTime::Immediate);
        }
        if let Some(rest) = s.strip_prefix("AFTER:") {
            let id = Uuid::parse_str(rest.trim())
                .map_err(|e| format!("Invalid action id in start time: {}", e))?;
            return Ok(StartTime::After(id));
        }
        if let Some(rest) = s.strip_prefix("WHEN:") {
            let mut parts = rest.split_whitespace();
            let (Some(id), Some(status), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(format!("Expected 'WHEN: <id> <STATUS>', got: {}", s));
            };
            let id = Uuid::parse_str(id)
                .map_err(|e| format!("Invalid action id in start time: {}", e))?;
            return Ok(StartTime::When(id, status.parse()?));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| StartTime::At(dt.with_timezone(&Utc)))
            .map_err(|e| format!("Invalid start time '{}': {}", s, e))
    }
}

impl From<StartTime> for String {
    fn from(value: StartTime) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for StartTime {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// =============================================================================
// Action record
// =============================================================================

/// A unit of work against a target entity, tracked through its status lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub description: String,
    pub target: String,
    pub target_kind: TargetKind,
    pub action: Verb,
    /// Action that triggered this one.
    pub cause: Option<ActionId>,
    /// Worker holding the execution lock. Set only while RUNNING.
    pub owner: Option<String>,
    /// Seconds between repeated executions, or [`RUN_ONCE`].
    pub interval: i64,
    pub start_time: StartTime,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds an owner may hold the action before it is considered abandoned.
    pub timeout: u64,
    pub status: ActionStatus,
    pub status_reason: String,
    pub inputs: Params,
    pub outputs: Params,
    pub depends_on: BTreeSet<ActionId>,
    pub depended_by: BTreeSet<ActionId>,
    /// RETRY outcomes consumed so far.
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Cancellation asked for while RUNNING. Cleared by the next claim or release.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_periodic(&self) -> bool {
        self.interval >= 0
    }

    /// Instant after which the current owner is presumed lost.
    pub fn ownership_deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::try_seconds(i64::try_from(self.timeout).ok()?)?;
        self.claimed_at
            .and_then(|claimed| claimed.checked_add_signed(timeout))
    }

    /// Whether the ownership timeout has expired at `now`.
    pub fn ownership_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionStatus::Running
            && self.ownership_deadline().is_some_and(|deadline| now > deadline)
    }
}

// =============================================================================
// Tests
// =============================================================================
