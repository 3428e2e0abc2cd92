//! Action lifecycle and dependency-scheduling engine for Senlin.
//!
//! Records actions against clusters, nodes and policies, orders them by
//! their dependencies, lets concurrent workers claim them safely and
//! dispatches them to pluggable operation handlers.

pub mod action;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod graph;
pub mod handler;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use action::state_machine::{resolve_outcome, validate_transition, Resolution};
pub use action::MemoryActionStore;
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use error::{EngineError, ExecutionError, OperationError};
pub use graph::DependencyGraph;
pub use handler::{ActionHandler, CancelFlag, ExecutionContext, PassthroughHandler};
pub use scheduler::{Scheduler, TickReport};
pub use types::{ActionSpec, DispatchResult, Outcome};
pub use worker::Worker;
