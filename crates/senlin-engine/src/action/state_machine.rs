//! Action state machine with validated transitions.
//!
//! INIT -> WAITING -> READY -> RUNNING -> SUCCEEDED/FAILED/CANCELLED
//! RUNNING -> READY (retry), WAITING/READY -> CANCELLED

use senlin_core::types::ActionStatus;

use crate::error::{EngineError, ExecutionError};
use crate::types::{DispatchResult, Outcome};

/// Validate that a status transition is allowed.
///
/// Valid transitions:
/// - Init -> Waiting
/// - Waiting -> Ready
/// - Waiting -> Cancelled
/// - Ready -> Running
/// - Ready -> Cancelled
/// - Running -> Succeeded
/// - Running -> Failed
/// - Running -> Ready (retry)
/// - Running -> Cancelled
pub fn validate_transition(from: ActionStatus, to: ActionStatus) -> Result<(), EngineError> {
    use ActionStatus::*;

    let valid = matches!(
        (from, to),
        (Init, Waiting)
            | (Waiting, Ready)
            | (Waiting, Cancelled)
            | (Ready, Running)
            | (Ready, Cancelled)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Ready)
            | (Running, Cancelled)
    );

    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition(from, to))
    }
}

/// Where a RUNNING action goes after its operation reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: ActionStatus,
    pub reason: String,
    pub retries: u32,
}

/// Map an operation result onto the next status.
///
/// `retries` is the number of RETRY outcomes already consumed. A RETRY past
/// `max_retries` becomes a failure. When cancellation was requested, any
/// outcome other than OK means the operation stopped early.
pub fn resolve_outcome(
    result: &DispatchResult,
    retries: u32,
    max_retries: u32,
    cancel_requested: bool,
) -> Resolution {
    if cancel_requested && result.outcome != Outcome::Ok {
        return Resolution {
            status: ActionStatus::Cancelled,
            reason: ExecutionError::Cancelled.to_string(),
            retries,
        };
    }

    match result.outcome {
        Outcome::Ok => Resolution {
            status: ActionStatus::Succeeded,
            reason: result.reason.clone(),
            retries,
        },
        Outcome::Failed => {
            let reason = if result.reason.is_empty() {
                "operation failed".to_string()
            } else {
                ExecutionError::OperationFailure(result.reason.clone()).to_string()
            };
            Resolution {
                status: ActionStatus::Failed,
                reason,
                retries,
            }
        }
        Outcome::Retry if retries < max_retries => Resolution {
            status: ActionStatus::Ready,
            reason: format!(
                "retry {}/{}: {}",
                retries + 1,
                max_retries,
                result.reason
            ),
            retries: retries + 1,
        },
        Outcome::Retry => Resolution {
            status: ActionStatus::Failed,
            reason: ExecutionError::RetryExhausted {
                attempts: retries + 1,
                reason: result.reason.clone(),
            }
            .to_string(),
            retries,
        },
    }
}
