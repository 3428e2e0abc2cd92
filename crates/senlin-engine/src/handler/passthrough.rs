//! Pass-through handler.
//!
//! Performs no work on the target: echoes the inputs back as outputs. Used
//! to exercise scheduling end to end without a real provisioning backend.

use async_trait::async_trait;
use serde_json::Value;

use senlin_core::types::Params;

use crate::error::OperationError;
use crate::handler::{ActionHandler, ExecutionContext};

/// Handler that succeeds immediately with its inputs as outputs.
pub struct PassthroughHandler;

#[async_trait]
impl ActionHandler for PassthroughHandler {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Params, OperationError> {
        ctx.checkpoint()?;

        tracing::info!(
            action_id = %ctx.action_id,
            target = %ctx.target,
            verb = %ctx.verb,
            "Simulated operation"
        );

        let mut outputs = ctx.inputs.clone();
        outputs.insert("simulated".to_string(), Value::Bool(true));
        Ok(outputs)
    }

    fn describe(&self, ctx: &ExecutionContext) -> String {
        format!("Simulate {} on {} {}", ctx.verb, ctx.target_kind, ctx.target)
    }
}
