//! Worker: claims one READY action, runs it through the dispatcher and
//! reports the outcome.

use std::sync::Arc;
use std::time::Duration;

use senlin_core::types::{Action, ActionId};

use crate::engine::Engine;
use crate::error::{EngineError, ExecutionError};
use crate::handler::ExecutionContext;
use crate::types::DispatchResult;

/// A unit of concurrent execution identified by its owner id.
pub struct Worker {
    id: String,
    engine: Arc<Engine>,
}

impl Worker {
    pub fn new(id: impl Into<String>, engine: Arc<Engine>) -> Self {
        Self {
            id: id.into(),
            engine,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and execute `action_id`.
    ///
    /// Returns `Ok(None)` on a scheduling miss: another worker won the claim,
    /// the action left READY first, or this worker's claim expired before it
    /// could release.
    pub async fn run(&self, action_id: ActionId) -> Result<Option<Action>, EngineError> {
        let action = match self.engine.claim(action_id, &self.id) {
            Ok(action) => action,
            Err(e) if e.is_scheduling_miss() || matches!(e, EngineError::InvalidTransition(..)) => {
                tracing::debug!(
                    action_id = %action_id,
                    worker = %self.id,
                    reason = %e,
                    "Claim missed"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let cancel = self.engine.cancel_flag(action.id);
        let ctx = ExecutionContext::new(&action, self.id.as_str(), cancel);
        let limit = Duration::from_secs(action.timeout);
        let result = match tokio::time::timeout(limit, self.dispatch_watched(&ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    action_id = %action.id,
                    worker = %self.id,
                    timeout = action.timeout,
                    "Operation exceeded ownership timeout"
                );
                DispatchResult::failed(ExecutionError::OwnershipTimeout.to_string())
            }
        };

        match self.engine.release(action.id, &self.id, &result) {
            Ok(released) => Ok(Some(released)),
            Err(e) if e.is_scheduling_miss() => {
                tracing::warn!(
                    action_id = %action.id,
                    worker = %self.id,
                    "Lost ownership before release"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the operation while polling the store for a cancel request made
    /// after the claim.
    async fn dispatch_watched(&self, ctx: &ExecutionContext) -> DispatchResult {
        let dispatch = self.engine.dispatcher().dispatch(ctx);
        tokio::pin!(dispatch);

        let period = Duration::from_millis(self.engine.config().poll_interval_ms.max(1));
        let mut poll = tokio::time::interval(period);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cancelled = false;

        loop {
            tokio::select! {
                result = &mut dispatch => return result,
                _ = poll.tick(), if !cancelled => {
                    cancelled = self.engine.refresh_cancel_flag(ctx.action_id);
                }
            }
        }
    }
}
