//! Error types for the action engine.

use senlin_core::error::SenlinError;
use senlin_core::store::StoreError;
use senlin_core::types::{ActionId, ActionStatus};

/// Errors returned synchronously by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Dependency cycle detected at action {0}")]
    CycleDetected(ActionId),
    #[error("Unknown dependency: {0}")]
    UnknownDependency(ActionId),
    #[error("Action {0} is already claimed")]
    AlreadyClaimed(ActionId),
    #[error("Action {id} is held by {actual:?}, not {worker}")]
    OwnershipMismatch {
        id: ActionId,
        worker: String,
        actual: Option<String>,
    },
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(ActionStatus, ActionStatus),
    #[error("Action not found: {0}")]
    NotFound(ActionId),
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    /// Expected races between workers. Callers retry these instead of
    /// reporting them.
    pub fn is_scheduling_miss(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyClaimed(_) | EngineError::OwnershipMismatch { .. }
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::AlreadyClaimed(id) => EngineError::AlreadyClaimed(id),
            StoreError::OwnershipMismatch {
                id,
                expected,
                actual,
            } => EngineError::OwnershipMismatch {
                id,
                worker: expected,
                actual,
            },
            other => EngineError::Store(other),
        }
    }
}

impl From<EngineError> for SenlinError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(e) => SenlinError::Storage(e.to_string()),
            other => SenlinError::Engine(other.to_string()),
        }
    }
}

/// Execution-time failures. Their display text is what lands in an action's
/// `status_reason`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("unsupported action")]
    DispatchUnsupported,
    #[error("ownership timeout")]
    OwnershipTimeout,
    #[error("{0}")]
    OperationFailure(String),
    #[error("retry budget exhausted after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: u32, reason: String },
    #[error("ancestor action {ancestor} ended {status}")]
    DependencyFailed {
        ancestor: ActionId,
        status: ActionStatus,
    },
    #[error("start condition on action {0} can no longer be met")]
    StartConditionUnreachable(ActionId),
    #[error("execution window closed")]
    WindowClosed,
    #[error("cancelled by request")]
    Cancelled,
}

/// How an operation handler reports that it did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Terminal failure.
    #[error("{0}")]
    Failed(String),
    /// Transient failure; the engine may run the action again.
    #[error("{0}")]
    Retry(String),
}
