//! Operation handler trait and execution context.
//!
//! Handlers perform the actual work for one (target kind, verb) pair. The
//! engine only knows how to reach them through the [`Dispatcher`] and how to
//! interpret what they report.
//!
//! [`Dispatcher`]: crate::dispatcher::Dispatcher

pub mod passthrough;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use senlin_core::types::{Action, ActionId, Params, TargetKind, Verb};

use crate::error::{ExecutionError, OperationError};

pub use passthrough::PassthroughHandler;

/// Cooperative cancellation flag shared between the engine and a running
/// operation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a handler sees about the action it is executing.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub action_id: ActionId,
    pub target: String,
    pub target_kind: TargetKind,
    pub verb: Verb,
    pub inputs: Params,
    pub worker_id: String,
    /// RETRY outcomes already consumed by earlier attempts.
    pub attempt: u32,
    cancel: CancelFlag,
}

impl ExecutionContext {
    pub fn new(action: &Action, worker_id: impl Into<String>, cancel: CancelFlag) -> Self {
        Self {
            action_id: action.id,
            target: action.target.clone(),
            target_kind: action.target_kind,
            verb: action.action,
            inputs: action.inputs.clone(),
            worker_id: worker_id.into(),
            attempt: action.retries,
            cancel,
        }
    }

    /// Whether a cancel request arrived for this action.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop point for long operations: returns an error once cancellation
    /// has been requested, so handlers can bail out with `?`.
    pub fn checkpoint(&self) -> Result<(), OperationError> {
        if self.is_cancelled() {
            Err(OperationError::Failed(ExecutionError::Cancelled.to_string()))
        } else {
            Ok(())
        }
    }

    /// Look up a string input.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(|v| v.as_str())
    }
}

/// An operation for one (target kind, verb) pair.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the operation. `Ok` carries the outputs to record on the action.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Params, OperationError>;

    /// Human-readable summary of what `execute` would do.
    fn describe(&self, ctx: &ExecutionContext) -> String {
        format!("{} {} {}", ctx.verb, ctx.target_kind, ctx.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionSpec;
    use chrono::Utc;
    use serde_json::json;

    fn context(flag: CancelFlag) -> ExecutionContext {
        let action = ActionSpec::new(TargetKind::Cluster, "cluster-a", Verb::Create)
            .with_input("size", json!(3))
            .with_input("profile", json!("small"))
            .into_action(60, Utc::now());
        ExecutionContext::new(&action, "worker-1", flag)
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let ctx = context(flag.clone());
        assert!(!ctx.is_cancelled());
        assert!(ctx.checkpoint().is_ok());

        flag.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(
            ctx.checkpoint(),
            Err(OperationError::Failed("cancelled by request".to_string()))
        );
    }

    #[test]
    fn test_context_copies_action_fields() {
        let ctx = context(CancelFlag::new());
        assert_eq!(ctx.target, "cluster-a");
        assert_eq!(ctx.target_kind, TargetKind::Cluster);
        assert_eq!(ctx.verb, Verb::Create);
        assert_eq!(ctx.worker_id, "worker-1");
        assert_eq!(ctx.attempt, 0);
        assert_eq!(ctx.input_str("profile"), Some("small"));
        assert_eq!(ctx.input_str("size"), None);
    }

    #[test]
    fn test_default_describe() {
        struct Noop;

        #[async_trait]
        impl ActionHandler for Noop {
            async fn execute(&self, _ctx: &ExecutionContext) -> Result<Params, OperationError> {
                Ok(Params::new())
            }
        }

        let ctx = context(CancelFlag::new());
        assert_eq!(Noop.describe(&ctx), "CREATE cluster cluster-a");
    }
}
