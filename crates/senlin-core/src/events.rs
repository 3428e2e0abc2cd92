use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionId, ActionStatus, TargetKind, Verb};

/// Events emitted by the engine as actions move through their lifecycle.
///
/// Consumed by the external API layer for polling or push notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ActionEvent {
    /// An action record was stored.
    ActionCreated {
        id: ActionId,
        target: String,
        target_kind: TargetKind,
        action: Verb,
        timestamp: DateTime<Utc>,
    },

    /// An action changed status.
    ActionStatusChanged {
        id: ActionId,
        old_status: ActionStatus,
        new_status: ActionStatus,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ActionEvent {
    /// The action this event refers to.
    pub fn action_id(&self) -> ActionId {
        match self {
            ActionEvent::ActionCreated { id, .. } | ActionEvent::ActionStatusChanged { id, .. } => {
                *id
            }
        }
    }

    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionEvent::ActionCreated { .. } => "action_created",
            ActionEvent::ActionStatusChanged { .. } => "action_status_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_changed_serializes_with_tag() {
        let id = Uuid::new_v4();
        let event = ActionEvent::ActionStatusChanged {
            id,
            old_status: ActionStatus::Running,
            new_status: ActionStatus::Failed,
            reason: "ownership timeout".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "action_status_changed");
        assert_eq!(json["old_status"], "RUNNING");
        assert_eq!(json["new_status"], "FAILED");
        assert_eq!(event.action_id(), id);
        assert_eq!(event.kind(), "action_status_changed");
    }

    #[test]
    fn test_created_round_trip() {
        let event = ActionEvent::ActionCreated {
            id: Uuid::new_v4(),
            target: "cluster-a".to_string(),
            target_kind: TargetKind::Cluster,
            action: Verb::Create,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ActionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "action_created");
    }
}
