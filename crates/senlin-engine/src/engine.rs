//! Action engine.
//!
//! Coordinates the store, the dependency graph and the dispatcher: records
//! new actions, claims and releases them for workers, promotes WAITING
//! actions when their dependencies and start predicates are satisfied,
//! cascades failures to dependents, and sweeps abandoned claims.
//!
//! Every status change goes through a compare-and-set on the store. The graph
//! lock is held across registration so that a batch becomes visible to the
//! scheduler only once all of it is WAITING.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use senlin_core::config::EngineConfig;
use senlin_core::events::ActionEvent;
use senlin_core::store::{ActionFilter, ActionStore, Release, StoreError};
use senlin_core::types::{Action, ActionId, ActionStatus, Params, StartTime};

use crate::action::state_machine::{resolve_outcome, validate_transition};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, ExecutionError};
use crate::graph::DependencyGraph;
use crate::handler::CancelFlag;
use crate::types::{ActionSpec, DispatchResult, Outcome};

/// Whether a WAITING action may move on, judged by its own predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Due,
    NotYet,
    /// `end_time` has passed.
    Expired,
    /// The start predicate refers to an action that can no longer satisfy it.
    Unreachable(ActionId),
}

/// The action lifecycle engine. Shared between the scheduler and its
/// workers behind an `Arc`.
pub struct Engine {
    store: Arc<dyn ActionStore>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    graph: Mutex<DependencyGraph>,
    resolved: Mutex<VecDeque<ActionId>>,
    cancel_flags: Mutex<HashMap<ActionId, CancelFlag>>,
    events: broadcast::Sender<ActionEvent>,
    wake: Notify,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    /// Create an engine over `store`, rebuilding the dependency graph from
    /// the records already stored.
    ///
    /// Records found in INIT are moved to WAITING, WAITING records whose
    /// dependencies all succeeded are queued for promotion, and dependents
    /// of failed records are cancelled.
    pub fn new(
        store: Arc<dyn ActionStore>,
        dispatcher: Arc<Dispatcher>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let actions = store.query(&ActionFilter::new())?;
        let graph = DependencyGraph::rebuild(&actions);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let engine = Self {
            store,
            dispatcher,
            config,
            graph: Mutex::new(graph),
            resolved: Mutex::new(VecDeque::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            events,
            wake: Notify::new(),
        };
        engine.recover(&actions)?;

        tracing::info!(actions = actions.len(), "Action engine started");
        Ok(engine)
    }

    fn recover(&self, actions: &[Action]) -> Result<(), EngineError> {
        let now = Utc::now();
        for action in actions {
            match action.status {
                ActionStatus::Init => {
                    self.store.cas_status(
                        action.id,
                        ActionStatus::Init,
                        ActionStatus::Waiting,
                        "",
                        now,
                    )?;
                    self.enqueue_if_resolved(action.id);
                }
                ActionStatus::Waiting => self.enqueue_if_resolved(action.id),
                ActionStatus::Failed | ActionStatus::Cancelled
                    if !action.depended_by.is_empty() =>
                {
                    self.cascade(action.id, action.status);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn ActionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.events.subscribe()
    }

    /// Wait until something changed that the scheduler should look at.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }

    pub fn get(&self, id: ActionId) -> Result<Action, EngineError> {
        Ok(self.store.get(id)?)
    }

    pub fn query(&self, filter: &ActionFilter) -> Result<Vec<Action>, EngineError> {
        Ok(self.store.query(filter)?)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Record a single new action. It is WAITING on return.
    pub fn register(&self, spec: ActionSpec) -> Result<Action, EngineError> {
        let mut stored = self.register_batch(vec![spec])?;
        stored
            .pop()
            .ok_or_else(|| EngineError::Validation("empty registration".to_string()))
    }

    /// Record several actions whose dependencies may refer to each other.
    ///
    /// The batch is validated as a whole; on error nothing is stored and the
    /// graph is unchanged.
    pub fn register_batch(&self, specs: Vec<ActionSpec>) -> Result<Vec<Action>, EngineError> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }
        for spec in &specs {
            spec.validate()?;
        }

        let now = Utc::now();
        let timeout = self.config.default_action_timeout_secs;
        let actions = specs
            .into_iter()
            .map(|spec| spec.into_action(timeout, now))
            .collect();
        self.insert(actions)
    }

    fn insert(&self, mut actions: Vec<Action>) -> Result<Vec<Action>, EngineError> {
        let mut graph = guard(&self.graph);

        let batch: HashSet<ActionId> = actions.iter().map(|a| a.id).collect();
        for action in &actions {
            for dep in &action.depends_on {
                if batch.contains(dep) || graph.contains(*dep) {
                    continue;
                }
                match self.store.get(*dep) {
                    Ok(parent) => self.adopt(&mut graph, &parent)?,
                    Err(StoreError::NotFound(_)) => {
                        return Err(EngineError::UnknownDependency(*dep))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if let Some(reference) = action.start_time.reference() {
                if !batch.contains(&reference) {
                    match self.store.get(reference) {
                        Ok(_) => {}
                        Err(StoreError::NotFound(_)) => {
                            return Err(EngineError::UnknownDependency(reference))
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        graph.check(&actions)?;

        // Stored WAITING by the same write that inserts it.
        validate_transition(ActionStatus::Init, ActionStatus::Waiting)?;
        let now = Utc::now();
        for action in &mut actions {
            action.status = ActionStatus::Waiting;
            action.updated_at = now;
        }
        self.store.put_all(&actions)?;
        graph.register(&actions)?;

        for action in &actions {
            self.emit(ActionEvent::ActionCreated {
                id: action.id,
                target: action.target.clone(),
                target_kind: action.target_kind,
                action: action.action,
                timestamp: action.created_at,
            });
            self.emit_status(action, ActionStatus::Init);

            tracing::info!(
                action_id = %action.id,
                target = %action.target,
                verb = %action.action,
                deps = action.depends_on.len(),
                "Action registered"
            );

            if graph.is_resolved(action.id) {
                guard(&self.resolved).push_back(action.id);
            }
        }
        drop(graph);

        self.wake.notify_one();
        Ok(actions)
    }

    // =========================================================================
    // Claim protocol
    // =========================================================================

    /// Atomically take ownership of a READY action and move it to RUNNING.
    ///
    /// Losing the race yields `AlreadyClaimed`; a record that is no longer
    /// READY yields `InvalidTransition`. Both are scheduling misses.
    pub fn claim(&self, id: ActionId, worker_id: &str) -> Result<Action, EngineError> {
        let claimed = match self.store.cas_claim(id, worker_id, Utc::now()) {
            Ok(action) => action,
            Err(StoreError::StatusMismatch { actual, .. }) => {
                return Err(EngineError::InvalidTransition(actual, ActionStatus::Running))
            }
            Err(e) => return Err(e.into()),
        };

        guard(&self.cancel_flags).entry(id).or_default();
        self.emit_status(&claimed, ActionStatus::Ready);
        tracing::info!(action_id = %id, worker = %worker_id, "Action claimed");
        Ok(claimed)
    }

    /// The cancellation flag handed to the operation running `id`.
    pub fn cancel_flag(&self, id: ActionId) -> CancelFlag {
        guard(&self.cancel_flags).entry(id).or_default().clone()
    }

    fn cancel_requested(&self, id: ActionId) -> bool {
        guard(&self.cancel_flags)
            .get(&id)
            .is_some_and(|flag| flag.is_cancelled())
    }

    /// Raise the local cancellation flag of `id` if a cancel was recorded in
    /// the store, possibly by another process. Returns whether the flag is
    /// raised.
    pub fn refresh_cancel_flag(&self, id: ActionId) -> bool {
        if self.cancel_requested(id) {
            return true;
        }
        match self.store.get(id) {
            Ok(action) if action.cancel_requested => {
                self.cancel_flag(id).cancel();
                tracing::info!(action_id = %id, "Cancellation request picked up from store");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(action_id = %id, error = %e, "Cancellation check failed");
                false
            }
        }
    }

    /// Give up ownership of a RUNNING action, recording the operation's
    /// result.
    ///
    /// Fails with `OwnershipMismatch` when `worker_id` no longer holds the
    /// action, e.g. because the sweep already expired the claim.
    pub fn release(
        &self,
        id: ActionId,
        worker_id: &str,
        result: &DispatchResult,
    ) -> Result<Action, EngineError> {
        let current = self.store.get(id)?;
        if current.owner.as_deref() != Some(worker_id) {
            return Err(EngineError::OwnershipMismatch {
                id,
                worker: worker_id.to_string(),
                actual: current.owner,
            });
        }

        let resolution = resolve_outcome(
            result,
            current.retries,
            self.config.max_retries,
            current.cancel_requested || self.cancel_requested(id),
        );
        validate_transition(current.status, resolution.status)?;

        let outputs = (result.outcome == Outcome::Ok || !result.outputs.is_empty())
            .then(|| result.outputs.clone());
        let release = Release {
            status: resolution.status,
            status_reason: resolution.reason,
            outputs,
            retries: resolution.retries,
            claimed_at: current.claimed_at,
        };
        let released = self.store.cas_release(id, worker_id, &release, Utc::now())?;

        match released.status {
            ActionStatus::Ready => tracing::warn!(
                action_id = %id,
                reason = %released.status_reason,
                "Action will be retried"
            ),
            ActionStatus::Succeeded => {
                tracing::info!(action_id = %id, worker = %worker_id, "Action succeeded")
            }
            status => tracing::warn!(
                action_id = %id,
                %status,
                reason = %released.status_reason,
                "Action did not succeed"
            ),
        }

        self.finish(&released, ActionStatus::Running);
        Ok(released)
    }

    /// Follow-up for a record that just left `old_status`.
    fn finish(&self, action: &Action, old_status: ActionStatus) {
        guard(&self.cancel_flags).remove(&action.id);
        self.emit_status(action, old_status);

        match action.status {
            ActionStatus::Succeeded => {
                let ready = guard(&self.graph).on_completed(action.id);
                guard(&self.resolved).extend(ready);
                if action.is_periodic() {
                    if let Err(e) = self.spawn_successor(action) {
                        tracing::error!(
                            action_id = %action.id,
                            error = %e,
                            "Failed to schedule next run"
                        );
                    }
                }
            }
            ActionStatus::Failed | ActionStatus::Cancelled => {
                self.cascade(action.id, action.status);
            }
            _ => {}
        }
        self.wake.notify_one();
    }

    /// Queue the next run of a periodic action `interval` seconds from now,
    /// unless that falls outside its execution window.
    fn spawn_successor(&self, prior: &Action) -> Result<Option<Action>, EngineError> {
        let now = Utc::now();
        let Some(start) = chrono::Duration::try_seconds(prior.interval)
            .and_then(|interval| now.checked_add_signed(interval))
        else {
            return Ok(None);
        };
        if prior.end_time.is_some_and(|end| start > end) {
            tracing::info!(action_id = %prior.id, "Execution window closed, not rescheduling");
            return Ok(None);
        }

        let successor = Action {
            id: Uuid::new_v4(),
            cause: Some(prior.id),
            owner: None,
            start_time: StartTime::At(start),
            status: ActionStatus::Init,
            status_reason: String::new(),
            outputs: Params::new(),
            depends_on: Default::default(),
            depended_by: Default::default(),
            retries: 0,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            cancel_requested: false,
            ..prior.clone()
        };
        let mut stored = self.insert(vec![successor])?;
        let next = stored.pop();
        if let Some(next) = &next {
            tracing::info!(
                action_id = %prior.id,
                next_id = %next.id,
                start = %start,
                "Scheduled next run"
            );
        }
        Ok(next)
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel an action.
    ///
    /// WAITING and READY actions are cancelled immediately and their
    /// dependents cascade. A RUNNING action is marked in the store so that
    /// its owner sees the request in whichever process runs it; it ends
    /// CANCELLED once its operation stops early.
    pub fn cancel(&self, id: ActionId) -> Result<Action, EngineError> {
        let action = self.cancel_record(id, &ExecutionError::Cancelled.to_string())?;
        if action.status == ActionStatus::Cancelled {
            tracing::info!(action_id = %id, "Action cancelled");
            self.cascade(id, ActionStatus::Cancelled);
        }
        Ok(action)
    }

    fn cancel_record(&self, id: ActionId, reason: &str) -> Result<Action, EngineError> {
        loop {
            let action = self.store.get(id)?;
            match action.status {
                ActionStatus::Waiting | ActionStatus::Ready => {
                    validate_transition(action.status, ActionStatus::Cancelled)?;
                    match self.store.cas_status(
                        id,
                        action.status,
                        ActionStatus::Cancelled,
                        reason,
                        Utc::now(),
                    ) {
                        Ok(cancelled) => {
                            guard(&self.cancel_flags).remove(&id);
                            self.emit_status(&cancelled, action.status);
                            return Ok(cancelled);
                        }
                        // Moved on under us; look again.
                        Err(StoreError::StatusMismatch { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                ActionStatus::Running => match self.store.request_cancel(id, Utc::now()) {
                    Ok(marked) => {
                        if let Some(flag) = guard(&self.cancel_flags).get(&id) {
                            flag.cancel();
                        }
                        tracing::info!(action_id = %id, "Cancellation requested for running action");
                        return Ok(marked);
                    }
                    // Released under us; look again.
                    Err(StoreError::StatusMismatch { .. }) => continue,
                    Err(e) => return Err(e.into()),
                },
                status => {
                    return Err(EngineError::InvalidTransition(status, ActionStatus::Cancelled))
                }
            }
        }
    }

    /// Cancel every transitive dependent of `root`, which ended `status`.
    fn cascade(&self, root: ActionId, status: ActionStatus) {
        let victims = guard(&self.graph).on_terminal_failure(root, status);
        if victims.is_empty() {
            return;
        }

        let reason = ExecutionError::DependencyFailed {
            ancestor: root,
            status,
        }
        .to_string();
        for victim in victims {
            match self.cancel_record(victim, &reason) {
                Ok(_) => tracing::info!(action_id = %victim, ancestor = %root, "Dependent cancelled"),
                Err(e) => tracing::warn!(
                    action_id = %victim,
                    error = %e,
                    "Failed to cancel dependent"
                ),
            }
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn enqueue_if_resolved(&self, id: ActionId) {
        if guard(&self.graph).is_resolved(id) {
            guard(&self.resolved).push_back(id);
        }
    }

    /// Drain the queue of actions whose dependencies resolved and promote
    /// those whose start predicate is due. Returns the promoted records.
    ///
    /// An entry that cannot be evaluated stays queued for the next cycle and
    /// does not hold up the rest.
    pub fn promote_resolved(&self, now: DateTime<Utc>) -> Result<Vec<Action>, EngineError> {
        let queued: Vec<ActionId> = guard(&self.resolved).drain(..).collect();

        let mut promoted = Vec::new();
        let mut deferred = Vec::new();
        for id in queued {
            let evaluated = self
                .store
                .get(id)
                .map_err(EngineError::from)
                .and_then(|action| self.evaluate(&action, now));
            match evaluated {
                Ok(Some(ready)) => promoted.push(ready),
                Ok(None) => {}
                Err(EngineError::NotFound(_)) => {
                    tracing::debug!(action_id = %id, "Queued action vanished");
                }
                Err(e) => {
                    tracing::warn!(action_id = %id, error = %e, "Promotion deferred");
                    deferred.push(id);
                }
            }
        }

        if !deferred.is_empty() {
            guard(&self.resolved).extend(deferred);
        }
        Ok(promoted)
    }

    /// Re-examine WAITING actions with a start predicate or an end time,
    /// and READY actions whose window closed. Returns records promoted to
    /// READY.
    pub fn evaluate_waiting(&self, now: DateTime<Utc>) -> Result<Vec<Action>, EngineError> {
        let waiting = self
            .store
            .query(&ActionFilter::new().with_status(ActionStatus::Waiting))?;

        // Records this engine has not seen were registered through another
        // engine sharing the store.
        let candidates: Vec<&Action> = {
            let graph = guard(&self.graph);
            waiting
                .iter()
                .filter(|a| {
                    a.start_time != StartTime::Immediate
                        || a.end_time.is_some()
                        || !graph.contains(a.id)
                })
                .collect()
        };

        let mut promoted = Vec::new();
        for action in candidates {
            if let Some(ready) = self.evaluate(action, now)? {
                promoted.push(ready);
            }
        }

        let ready = self
            .store
            .query(&ActionFilter::new().with_status(ActionStatus::Ready))?;
        for action in ready
            .iter()
            .filter(|a| a.end_time.is_some_and(|end| now > end))
        {
            self.close_window(action.id, ExecutionError::WindowClosed);
        }
        Ok(promoted)
    }

    fn evaluate(&self, action: &Action, now: DateTime<Utc>) -> Result<Option<Action>, EngineError> {
        if action.status != ActionStatus::Waiting {
            return Ok(None);
        }

        match self.readiness(action, now)? {
            Readiness::NotYet => Ok(None),
            Readiness::Expired => {
                self.close_window(action.id, ExecutionError::WindowClosed);
                Ok(None)
            }
            Readiness::Unreachable(reference) => {
                self.close_window(
                    action.id,
                    ExecutionError::StartConditionUnreachable(reference),
                );
                Ok(None)
            }
            Readiness::Due => {
                let resolved = {
                    let mut graph = guard(&self.graph);
                    if !graph.contains(action.id) {
                        self.adopt(&mut graph, action)?;
                    }
                    graph.is_resolved(action.id)
                };
                if resolved {
                    self.promote(action.id, now)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Bring a stored record into the graph, ancestors first.
    fn adopt(&self, graph: &mut DependencyGraph, action: &Action) -> Result<(), EngineError> {
        for dep in &action.depends_on {
            if !graph.contains(*dep) {
                let parent = self.store.get(*dep)?;
                self.adopt(graph, &parent)?;
            }
        }
        graph.adopt(action);
        Ok(())
    }

    fn readiness(&self, action: &Action, now: DateTime<Utc>) -> Result<Readiness, EngineError> {
        if action.end_time.is_some_and(|end| now > end) {
            return Ok(Readiness::Expired);
        }

        let reference = match action.start_time {
            StartTime::Immediate => return Ok(Readiness::Due),
            StartTime::At(at) if at <= now => return Ok(Readiness::Due),
            StartTime::At(_) => return Ok(Readiness::NotYet),
            StartTime::After(id) | StartTime::When(id, _) => match self.store.get(id) {
                Ok(reference) => reference,
                Err(StoreError::NotFound(_)) => return Ok(Readiness::Unreachable(id)),
                Err(e) => return Err(e.into()),
            },
        };

        let readiness = match action.start_time {
            StartTime::When(_, wanted) if reference.status == wanted => Readiness::Due,
            StartTime::When(id, _) if reference.is_terminal() => Readiness::Unreachable(id),
            StartTime::After(_) if reference.is_terminal() => Readiness::Due,
            _ => Readiness::NotYet,
        };
        Ok(readiness)
    }

    fn promote(&self, id: ActionId, now: DateTime<Utc>) -> Result<Option<Action>, EngineError> {
        validate_transition(ActionStatus::Waiting, ActionStatus::Ready)?;
        match self.store.cas_status(
            id,
            ActionStatus::Waiting,
            ActionStatus::Ready,
            "dependencies resolved",
            now,
        ) {
            Ok(ready) => {
                self.emit_status(&ready, ActionStatus::Waiting);
                tracing::debug!(action_id = %id, "Action ready");
                Ok(Some(ready))
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                tracing::debug!(action_id = %id, status = %actual, "Promotion skipped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close_window(&self, id: ActionId, reason: ExecutionError) {
        match self.cancel_record(id, &reason.to_string()) {
            Ok(action) if action.status == ActionStatus::Cancelled => {
                tracing::info!(action_id = %id, reason = %reason, "Action cancelled");
                self.cascade(id, ActionStatus::Cancelled);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(action_id = %id, error = %e, "Failed to cancel action"),
        }
    }

    /// READY actions, oldest first, at most `limit` of them.
    pub fn ready_actions(&self, limit: usize) -> Result<Vec<Action>, EngineError> {
        Ok(self.store.query(
            &ActionFilter::new()
                .with_status(ActionStatus::Ready)
                .with_limit(limit),
        )?)
    }

    /// Force-release RUNNING actions whose owner held them past their
    /// timeout. They end FAILED with reason "ownership timeout".
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<ActionId>, EngineError> {
        let running = self
            .store
            .query(&ActionFilter::new().with_status(ActionStatus::Running))?;

        let mut swept = Vec::new();
        for action in running.into_iter().filter(|a| a.ownership_expired(now)) {
            let Some(owner) = action.owner.as_deref() else {
                continue;
            };
            let release = Release {
                status: ActionStatus::Failed,
                status_reason: ExecutionError::OwnershipTimeout.to_string(),
                outputs: None,
                retries: action.retries,
                claimed_at: action.claimed_at,
            };
            match self.store.cas_release(action.id, owner, &release, now) {
                Ok(released) => {
                    tracing::warn!(
                        action_id = %action.id,
                        worker = %owner,
                        timeout = action.timeout,
                        "Ownership expired, worker presumed lost"
                    );
                    self.finish(&released, ActionStatus::Running);
                    swept.push(action.id);
                }
                Err(StoreError::OwnershipMismatch { .. } | StoreError::StatusMismatch { .. }) => {
                    tracing::debug!(action_id = %action.id, "Released before sweep");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(swept)
    }

    // =========================================================================
    // Events
    // =========================================================================

    fn emit(&self, event: ActionEvent) {
        tracing::trace!(kind = event.kind(), action_id = %event.action_id(), "Event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self, action: &Action, old_status: ActionStatus) {
        self.emit(ActionEvent::ActionStatusChanged {
            id: action.id,
            old_status,
            new_status: action.status,
            reason: action.status_reason.clone(),
            timestamp: action.updated_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MemoryActionStore;
    use crate::handler::PassthroughHandler;
    use senlin_core::types::{TargetKind, Verb};

    fn engine_with(store: Arc<dyn ActionStore>, config: EngineConfig) -> Engine {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_all(Arc::new(PassthroughHandler));
        Engine::new(store, Arc::new(dispatcher), config).unwrap()
    }

    fn engine() -> Engine {
        engine_with(Arc::new(MemoryActionStore::new()), EngineConfig::default())
    }

    fn cluster_create() -> ActionSpec {
        ActionSpec::new(TargetKind::Cluster, "cluster-a", Verb::Create)
    }

    fn node_join() -> ActionSpec {
        ActionSpec::new(TargetKind::Node, "node-1", Verb::Join)
    }

    fn run_to(engine: &Engine, id: ActionId, result: DispatchResult) -> Action {
        engine.claim(id, "w1").unwrap();
        engine.release(id, "w1", &result).unwrap()
    }

    /// Memory store whose reads and status updates can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryActionStore,
        fail_get_once: Mutex<Option<ActionId>>,
        fail_cas_status: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn unavailable() -> StoreError {
            StoreError::Backend("database is locked".to_string())
        }

        fn set_fail_cas_status(&self, fail: bool) {
            self.fail_cas_status
                .store(fail, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl ActionStore for FlakyStore {
        fn get(&self, id: ActionId) -> Result<Action, StoreError> {
            let mut failing = self.fail_get_once.lock().unwrap();
            if *failing == Some(id) {
                *failing = None;
                return Err(Self::unavailable());
            }
            drop(failing);
            self.inner.get(id)
        }

        fn put_all(&self, actions: &[Action]) -> Result<(), StoreError> {
            self.inner.put_all(actions)
        }

        fn cas_claim(
            &self,
            id: ActionId,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Action, StoreError> {
            self.inner.cas_claim(id, worker_id, now)
        }

        fn cas_release(
            &self,
            id: ActionId,
            worker_id: &str,
            release: &Release,
            now: DateTime<Utc>,
        ) -> Result<Action, StoreError> {
            self.inner.cas_release(id, worker_id, release, now)
        }

        fn cas_status(
            &self,
            id: ActionId,
            from: ActionStatus,
            to: ActionStatus,
            reason: &str,
            now: DateTime<Utc>,
        ) -> Result<Action, StoreError> {
            if self.fail_cas_status.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.cas_status(id, from, to, reason, now)
        }

        fn request_cancel(&self, id: ActionId, now: DateTime<Utc>) -> Result<Action, StoreError> {
            self.inner.request_cancel(id, now)
        }

        fn query(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
            self.inner.query(filter)
        }
    }

    // ---- registration ----

    #[test]
    fn test_register_moves_to_waiting_and_queues() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        assert_eq!(action.status, ActionStatus::Waiting);

        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].status, ActionStatus::Ready);
    }

    #[test]
    fn test_register_stores_waiting_without_status_update() {
        let store = Arc::new(FlakyStore::default());
        let engine = engine_with(store.clone(), EngineConfig::default());
        store.set_fail_cas_status(true);

        let a = cluster_create();
        let b = node_join().depends_on(a.id);
        let stored = engine.register_batch(vec![a, b]).unwrap();
        for action in &stored {
            assert_eq!(action.status, ActionStatus::Waiting);
            assert_eq!(store.get(action.id).unwrap().status, ActionStatus::Waiting);
        }

        // Promotion needs the status update; the entry waits for it.
        assert!(engine.promote_resolved(Utc::now()).unwrap().is_empty());
        store.set_fail_cas_status(false);
        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, stored[0].id);
    }

    #[test]
    fn test_promotion_error_keeps_entry_queued() {
        let store = Arc::new(FlakyStore::default());
        let engine = engine_with(store.clone(), EngineConfig::default());
        let first = engine.register(cluster_create()).unwrap();
        let second = engine.register(node_join()).unwrap();

        *store.fail_get_once.lock().unwrap() = Some(first.id);
        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, second.id);
        assert_eq!(engine.get(first.id).unwrap().status, ActionStatus::Waiting);

        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, first.id);
    }

    #[test]
    fn test_register_emits_events() {
        let engine = engine();
        let mut events = engine.subscribe();
        let action = engine.register(cluster_create()).unwrap();

        let created = events.try_recv().unwrap();
        assert_eq!(created.kind(), "action_created");
        assert_eq!(created.action_id(), action.id);

        match events.try_recv().unwrap() {
            ActionEvent::ActionStatusChanged {
                old_status,
                new_status,
                ..
            } => {
                assert_eq!(old_status, ActionStatus::Init);
                assert_eq!(new_status, ActionStatus::Waiting);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_register_unknown_dependency() {
        let engine = engine();
        let missing = Uuid::new_v4();
        let err = engine.register(node_join().depends_on(missing)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDependency(id) if id == missing));
        assert!(engine.query(&ActionFilter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_register_unknown_start_reference() {
        let engine = engine();
        let spec = node_join().with_start_time(StartTime::After(Uuid::new_v4()));
        assert!(matches!(
            engine.register(spec),
            Err(EngineError::UnknownDependency(_))
        ));
    }

    #[test]
    fn test_batch_cycle_rejected_and_nothing_stored() {
        let engine = engine();
        let existing = engine.register(cluster_create()).unwrap();

        let mut a = node_join();
        let mut b = ActionSpec::new(TargetKind::Node, "node-2", Verb::Join);
        a = a.depends_on(b.id).depends_on(existing.id);
        b = b.depends_on(a.id);

        let err = engine.register_batch(vec![a, b]).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected(_)));
        assert_eq!(engine.query(&ActionFilter::new()).unwrap().len(), 1);
        assert_eq!(guard(&engine.graph).len(), 1);
    }

    #[test]
    fn test_register_on_dead_dependency_rejected() {
        let engine = engine();
        let parent = engine.register(cluster_create()).unwrap();
        engine.cancel(parent.id).unwrap();

        let err = engine.register(node_join().depends_on(parent.id)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    // ---- claim / release ----

    #[test]
    fn test_claim_requires_ready() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        let err = engine.claim(action.id, "w1").unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition(ActionStatus::Waiting, ActionStatus::Running)
        ));
    }

    #[test]
    fn test_second_claim_is_a_miss() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();

        let claimed = engine.claim(action.id, "w1").unwrap();
        assert_eq!(claimed.owner.as_deref(), Some("w1"));
        let err = engine.claim(action.id, "w2").unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClaimed(_)));
        assert!(err.is_scheduling_miss());
    }

    #[test]
    fn test_release_by_wrong_worker() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        engine.claim(action.id, "w1").unwrap();

        let err = engine
            .release(action.id, "w2", &DispatchResult::ok(Params::new()))
            .unwrap_err();
        assert!(matches!(err, EngineError::OwnershipMismatch { .. }));
        assert_eq!(engine.get(action.id).unwrap().status, ActionStatus::Running);
    }

    #[test]
    fn test_success_resolves_dependent() {
        let engine = engine();
        let a = cluster_create();
        let b = node_join().depends_on(a.id);
        let (a_id, b_id) = (a.id, b.id);
        engine.register_batch(vec![a, b]).unwrap();

        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, a_id);

        let done = run_to(&engine, a_id, DispatchResult::ok(Params::new()));
        assert_eq!(done.status, ActionStatus::Succeeded);
        assert!(done.owner.is_none());
        assert!(done.outputs.is_empty());

        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, b_id);
    }

    #[test]
    fn test_retry_then_exhausted() {
        let config = EngineConfig {
            max_retries: 1,
            ..EngineConfig::default()
        };
        let engine = engine_with(Arc::new(MemoryActionStore::new()), config);
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();

        let first = run_to(&engine, action.id, DispatchResult::retry("busy"));
        assert_eq!(first.status, ActionStatus::Ready);
        assert_eq!(first.retries, 1);
        assert!(first.owner.is_none());

        let second = run_to(&engine, action.id, DispatchResult::retry("busy"));
        assert_eq!(second.status, ActionStatus::Failed);
        assert!(second.status_reason.starts_with("retry budget exhausted"));
    }

    #[test]
    fn test_failure_cascades_to_every_transitive_dependent() {
        let engine = engine();
        let a = cluster_create();
        let b = node_join().depends_on(a.id);
        let c = ActionSpec::new(TargetKind::Policy, "p-1", Verb::Enable).depends_on(b.id);
        let d = ActionSpec::new(TargetKind::Node, "node-2", Verb::Join)
            .depends_on(a.id)
            .depends_on(b.id);
        let ids = [a.id, b.id, c.id, d.id];
        engine.register_batch(vec![a, b, c, d]).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();

        let mut events = engine.subscribe();
        let failed = run_to(&engine, ids[0], DispatchResult::failed("quota exceeded"));
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.status_reason, "quota exceeded");

        for id in &ids[1..] {
            let action = engine.get(*id).unwrap();
            assert_eq!(action.status, ActionStatus::Cancelled);
            assert!(action.status_reason.contains(&ids[0].to_string()));
        }

        let mut cancelled = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ActionEvent::ActionStatusChanged {
                id,
                new_status: ActionStatus::Cancelled,
                ..
            } = event
            {
                cancelled.push(id);
            }
        }
        cancelled.sort();
        let mut expected = ids[1..].to_vec();
        expected.sort();
        assert_eq!(cancelled, expected, "each dependent cancelled exactly once");
    }

    #[test]
    fn test_unsupported_outcome_recorded() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        let failed = run_to(&engine, action.id, DispatchResult::failed("unsupported action"));
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.status_reason, "unsupported action");
    }

    // ---- cancellation ----

    #[test]
    fn test_cancel_waiting_is_immediate() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        let cancelled = engine.cancel(action.id).unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert_eq!(cancelled.status_reason, "cancelled by request");
        assert!(engine.promote_resolved(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_cancel_running_sets_flag() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        engine.claim(action.id, "w1").unwrap();
        let flag = engine.cancel_flag(action.id);

        let still_running = engine.cancel(action.id).unwrap();
        assert_eq!(still_running.status, ActionStatus::Running);
        assert!(still_running.cancel_requested);
        assert!(engine.get(action.id).unwrap().cancel_requested);
        assert!(flag.is_cancelled());

        let released = engine
            .release(action.id, "w1", &DispatchResult::failed("stopped early"))
            .unwrap();
        assert_eq!(released.status, ActionStatus::Cancelled);
    }

    #[test]
    fn test_cancel_recorded_by_another_engine_is_honoured() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        engine.claim(action.id, "w1").unwrap();
        let flag = engine.cancel_flag(action.id);

        engine.store().request_cancel(action.id, Utc::now()).unwrap();
        assert!(!flag.is_cancelled());
        assert!(engine.refresh_cancel_flag(action.id));
        assert!(flag.is_cancelled());

        let released = engine
            .release(action.id, "w1", &DispatchResult::failed("stopped early"))
            .unwrap();
        assert_eq!(released.status, ActionStatus::Cancelled);
        assert!(!released.cancel_requested);
    }

    #[test]
    fn test_release_reads_stored_cancel_request() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        engine.claim(action.id, "w1").unwrap();

        // No local flag was ever raised.
        engine.store().request_cancel(action.id, Utc::now()).unwrap();
        let released = engine
            .release(action.id, "w1", &DispatchResult::failed("stopped early"))
            .unwrap();
        assert_eq!(released.status, ActionStatus::Cancelled);
    }

    #[test]
    fn test_cancel_running_that_completes_keeps_success() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        engine.claim(action.id, "w1").unwrap();
        engine.cancel(action.id).unwrap();

        let released = engine
            .release(action.id, "w1", &DispatchResult::ok(Params::new()))
            .unwrap();
        assert_eq!(released.status, ActionStatus::Succeeded);
    }

    #[test]
    fn test_cancel_terminal_is_rejected() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.cancel(action.id).unwrap();
        assert!(matches!(
            engine.cancel(action.id),
            Err(EngineError::InvalidTransition(ActionStatus::Cancelled, ActionStatus::Cancelled))
        ));
    }

    // ---- start predicates ----

    #[test]
    fn test_start_time_in_future_waits() {
        let engine = engine();
        let start = Utc::now() + chrono::Duration::seconds(60);
        let action = engine
            .register(cluster_create().with_start_time(StartTime::At(start)))
            .unwrap();

        assert!(engine.promote_resolved(Utc::now()).unwrap().is_empty());
        assert!(engine.evaluate_waiting(Utc::now()).unwrap().is_empty());

        let later = start + chrono::Duration::seconds(1);
        let promoted = engine.evaluate_waiting(later).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, action.id);
    }

    #[test]
    fn test_after_predicate_waits_for_any_terminal() {
        let engine = engine();
        let first = engine.register(cluster_create()).unwrap();
        let second = engine
            .register(node_join().with_start_time(StartTime::After(first.id)))
            .unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(engine.get(second.id).unwrap().status, ActionStatus::Waiting);

        run_to(&engine, first.id, DispatchResult::failed("boom"));
        let promoted = engine.evaluate_waiting(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, second.id);
    }

    #[test]
    fn test_when_predicate_unreachable_cancels() {
        let engine = engine();
        let first = engine.register(cluster_create()).unwrap();
        let second = engine
            .register(
                node_join().with_start_time(StartTime::When(first.id, ActionStatus::Succeeded)),
            )
            .unwrap();
        engine.promote_resolved(Utc::now()).unwrap();

        run_to(&engine, first.id, DispatchResult::failed("boom"));
        engine.evaluate_waiting(Utc::now()).unwrap();
        let second = engine.get(second.id).unwrap();
        assert_eq!(second.status, ActionStatus::Cancelled);
        assert!(second.status_reason.contains("can no longer be met"));
    }

    #[test]
    fn test_window_closed_cancels_ready_action() {
        let engine = engine();
        let now = Utc::now();
        let action = engine
            .register(cluster_create().with_end_time(now + chrono::Duration::seconds(30)))
            .unwrap();
        engine.promote_resolved(now).unwrap();

        engine
            .evaluate_waiting(now + chrono::Duration::seconds(31))
            .unwrap();
        let action = engine.get(action.id).unwrap();
        assert_eq!(action.status, ActionStatus::Cancelled);
        assert_eq!(action.status_reason, "execution window closed");
    }

    // ---- periodic actions ----

    #[test]
    fn test_run_once_spawns_no_successor() {
        let engine = engine();
        let action = engine.register(cluster_create()).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        run_to(&engine, action.id, DispatchResult::ok(Params::new()));
        assert_eq!(engine.query(&ActionFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_periodic_spawns_one_successor() {
        let engine = engine();
        let action = engine
            .register(
                ActionSpec::new(TargetKind::Cluster, "cluster-a", Verb::Update).with_interval(300),
            )
            .unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        let before = Utc::now();
        run_to(&engine, action.id, DispatchResult::ok(Params::new()));

        let waiting = engine
            .query(&ActionFilter::new().with_status(ActionStatus::Waiting))
            .unwrap();
        assert_eq!(waiting.len(), 1);
        let next = &waiting[0];
        assert_eq!(next.cause, Some(action.id));
        assert_eq!(next.interval, 300);
        match next.start_time {
            StartTime::At(at) => assert!(at >= before + chrono::Duration::seconds(300)),
            other => panic!("unexpected start time: {other:?}"),
        }
    }

    #[test]
    fn test_periodic_respects_end_time() {
        let engine = engine();
        let action = engine
            .register(
                ActionSpec::new(TargetKind::Cluster, "cluster-a", Verb::Update)
                    .with_interval(3600)
                    .with_end_time(Utc::now() + chrono::Duration::seconds(60)),
            )
            .unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        run_to(&engine, action.id, DispatchResult::ok(Params::new()));
        assert_eq!(engine.query(&ActionFilter::new()).unwrap().len(), 1);
    }

    // ---- sweep ----

    #[test]
    fn test_sweep_fails_expired_claims() {
        let engine = engine();
        let action = engine.register(cluster_create().with_timeout(5)).unwrap();
        let dependent = engine.register(node_join().depends_on(action.id)).unwrap();
        engine.promote_resolved(Utc::now()).unwrap();
        let claimed = engine.claim(action.id, "w1").unwrap();
        let claimed_at = claimed.claimed_at.unwrap();

        assert!(engine.sweep_expired(claimed_at).unwrap().is_empty());

        let swept = engine
            .sweep_expired(claimed_at + chrono::Duration::seconds(6))
            .unwrap();
        assert_eq!(swept, vec![action.id]);

        let failed = engine.get(action.id).unwrap();
        assert_eq!(failed.status, ActionStatus::Failed);
        assert_eq!(failed.status_reason, "ownership timeout");
        assert!(failed.owner.is_none());
        assert_eq!(engine.get(dependent.id).unwrap().status, ActionStatus::Cancelled);

        // the lost worker's late release is refused
        let err = engine
            .release(action.id, "w1", &DispatchResult::ok(Params::new()))
            .unwrap_err();
        assert!(err.is_scheduling_miss());
    }

    // ---- recovery ----

    #[test]
    fn test_restart_rebuilds_graph() {
        let store: Arc<dyn ActionStore> = Arc::new(MemoryActionStore::new());
        let (a_id, b_id) = {
            let engine = engine_with(Arc::clone(&store), EngineConfig::default());
            let a = cluster_create();
            let b = node_join().depends_on(a.id);
            let ids = (a.id, b.id);
            engine.register_batch(vec![a, b]).unwrap();
            engine.promote_resolved(Utc::now()).unwrap();
            run_to(&engine, ids.0, DispatchResult::ok(Params::new()));
            ids
        };

        let engine = engine_with(store, EngineConfig::default());
        assert_eq!(guard(&engine.graph).len(), 2);
        let promoted = engine.promote_resolved(Utc::now()).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, b_id);
        assert_eq!(engine.get(a_id).unwrap().status, ActionStatus::Succeeded);
    }
}
