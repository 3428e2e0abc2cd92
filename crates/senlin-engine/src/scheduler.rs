//! Scheduler loop.
//!
//! Each cycle promotes actions whose dependencies resolved, re-evaluates
//! time-based start predicates, sweeps expired claims and then offers READY
//! actions, oldest first, to idle worker capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::worker::Worker;

/// What one scheduler cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub swept: usize,
    pub dispatched: usize,
}

/// Background scheduler driving an [`Engine`] with a bounded worker pool.
pub struct Scheduler {
    engine: Arc<Engine>,
    id: String,
    workers: usize,
    capacity: Arc<Semaphore>,
    next_worker: AtomicU64,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler running at most `engine.config().workers` actions
    /// at once.
    pub fn new(engine: Arc<Engine>) -> Self {
        let workers = engine.config().workers.max(1);
        Self {
            engine,
            id: Uuid::new_v4().simple().to_string(),
            workers,
            capacity: Arc::new(Semaphore::new(workers)),
            next_worker: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Number of workers currently idle.
    pub fn idle_workers(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Run one scheduling cycle. Dispatched actions keep executing in the
    /// background after this returns.
    pub async fn tick(&self) -> Result<TickReport, EngineError> {
        let now = Utc::now();
        let mut report = TickReport::default();

        report.promoted += self.engine.promote_resolved(now)?.len();
        report.promoted += self.engine.evaluate_waiting(now)?.len();
        report.swept = self.engine.sweep_expired(now)?.len();

        let idle = self.idle_workers();
        if idle == 0 {
            return Ok(report);
        }

        for action in self.engine.ready_actions(idle)? {
            let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned() else {
                break;
            };
            let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::new(format!("{}-{}", self.id, n), Arc::clone(&self.engine));
            let action_id = action.id;

            tokio::spawn(async move {
                match worker.run(action_id).await {
                    Ok(_) => {}
                    Err(e) => tracing::error!(
                        action_id = %action_id,
                        worker = %worker.id(),
                        error = %e,
                        "Worker failed"
                    ),
                }
                drop(permit);
            });
            report.dispatched += 1;
        }

        if report != TickReport::default() {
            tracing::debug!(
                promoted = report.promoted,
                swept = report.swept,
                dispatched = report.dispatched,
                "Scheduler cycle"
            );
        }
        Ok(report)
    }

    /// Wait until every dispatched action has been released.
    pub async fn wait_idle(&self) {
        let workers = u32::try_from(self.workers).unwrap_or(u32::MAX);
        if let Ok(permits) = self.capacity.acquire_many(workers).await {
            drop(permits);
        }
    }

    /// Start the scheduler loop.
    ///
    /// Cycles every `poll_interval_ms`, or sooner when the engine reports a
    /// change. Returns on shutdown signal once in-flight actions finished.
    pub async fn run(&self) {
        let poll = Duration::from_millis(self.engine.config().poll_interval_ms.max(1));
        tracing::info!(
            workers = self.workers,
            poll_ms = poll.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Scheduler cycle failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.engine.notified() => {}
                _ = self.shutdown.notified() => break,
            }
        }

        self.wait_idle().await;
        tracing::info!("Scheduler stopped");
    }

    /// Signal the scheduler to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
