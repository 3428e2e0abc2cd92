//! Dispatcher from (target kind, verb) to the registered operation.
//!
//! Holds no business logic of its own: it checks that the verb belongs to the
//! kind's closed verb set and forwards to the handler registered for the pair.

use std::collections::HashMap;
use std::sync::Arc;

use senlin_core::types::{TargetKind, Verb};

use crate::error::{EngineError, ExecutionError, OperationError};
use crate::handler::{ActionHandler, ExecutionContext};
use crate::types::DispatchResult;

/// Registry of operation handlers keyed by (target kind, verb).
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<(TargetKind, Verb), Arc<dyn ActionHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same pair.
    ///
    /// Fails if `verb` is not part of `kind`'s verb set.
    pub fn register(
        &mut self,
        kind: TargetKind,
        verb: Verb,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), EngineError> {
        if !kind.supports(verb) {
            return Err(EngineError::Validation(format!(
                "{} is not a {} action",
                verb, kind
            )));
        }
        if self.handlers.insert((kind, verb), handler).is_some() {
            tracing::debug!(%kind, %verb, "Replaced action handler");
        }
        Ok(())
    }

    /// Register `handler` for every verb of every kind.
    pub fn register_all(&mut self, handler: Arc<dyn ActionHandler>) {
        for kind in TargetKind::ALL {
            for verb in kind.verbs() {
                self.handlers.insert((kind, *verb), Arc::clone(&handler));
            }
        }
    }

    /// Whether an operation is registered for the pair.
    pub fn supports(&self, kind: TargetKind, verb: Verb) -> bool {
        kind.supports(verb) && self.handlers.contains_key(&(kind, verb))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the operation for the context's (kind, verb) and map its result
    /// onto OK / FAILED / RETRY.
    pub async fn dispatch(&self, ctx: &ExecutionContext) -> DispatchResult {
        let handler = match self.handlers.get(&(ctx.target_kind, ctx.verb)) {
            Some(handler) if ctx.target_kind.supports(ctx.verb) => handler,
            _ => {
                tracing::warn!(
                    action_id = %ctx.action_id,
                    kind = %ctx.target_kind,
                    verb = %ctx.verb,
                    "No operation for action"
                );
                return DispatchResult::failed(ExecutionError::DispatchUnsupported.to_string());
            }
        };

        tracing::debug!(
            action_id = %ctx.action_id,
            worker = %ctx.worker_id,
            "Dispatching: {}",
            handler.describe(ctx)
        );

        match handler.execute(ctx).await {
            Ok(outputs) => DispatchResult::ok(outputs),
            Err(OperationError::Failed(reason)) => DispatchResult::failed(reason),
            Err(OperationError::Retry(reason)) => DispatchResult::retry(reason),
        }
    }
}
