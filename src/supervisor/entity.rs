//! Work entities and their crash-isolating wrapper.

use crate::config::RestartPolicy;
use crate::store::types::EntityId;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One unit of recurring work, e.g. the schedule poller of an app partition.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Prepares the entity. Called once after construction and again before
    /// every restart that follows a crash.
    fn init(&self) -> anyhow::Result<()>;

    /// Runs until `stop` is requested. A panic here is treated as a crash.
    async fn start(&self);

    /// Requests the running `start` to finish. Must not block.
    fn stop(&self);
}

/// Wraps an `Entity` so that a crash inside `start` becomes a bounded,
/// backed-off restart instead of taking the node down.
pub struct RecoverableEntity {
    id: EntityId,
    obj: Arc<dyn Entity>,
    policy: RestartPolicy,
    /// Total restarts over the lifetime of this wrapper.
    recovered: AtomicU32,
    running: AtomicBool,
    failed: AtomicBool,
    stop_requested: AtomicBool,
}

impl RecoverableEntity {
    pub fn new(id: EntityId, obj: Arc<dyn Entity>, policy: RestartPolicy) -> Arc<Self> {
        Arc::new(Self {
            id,
            obj,
            policy,
            recovered: AtomicU32::new(0),
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        })
    }

    /// Launches the entity on its own task.
    ///
    /// Returns `false` without doing anything when a run is already in
    /// progress, so one wrapper never executes twice concurrently.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Entity {} already running, start ignored", self.id);
            return false;
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);

        let entity = self.clone();
        tokio::spawn(async move {
            entity.supervise().await;
        });

        true
    }

    /// Signals the entity to stop. Does not wait for the run to finish.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.obj.stop();
    }

    async fn supervise(self: Arc<Self>) {
        let mut restarts = 0u32;
        let mut backoff = self.policy.initial_backoff;

        loop {
            let obj = self.obj.clone();
            let launched = tokio::time::Instant::now();
            let run = tokio::spawn(async move { obj.start().await });

            match run.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    if self.stop_requested.load(Ordering::SeqCst) {
                        break;
                    }

                    // A run that outlived the longest backoff was healthy; only
                    // crashes in a row count against the budget.
                    if launched.elapsed() >= self.policy.max_backoff {
                        restarts = 0;
                        backoff = self.policy.initial_backoff;
                    }

                    if restarts >= self.policy.max_restarts {
                        tracing::error!(
                            "Entity {} crashed {} times in a row, giving up",
                            self.id,
                            restarts + 1
                        );
                        self.failed.store(true, Ordering::SeqCst);
                        break;
                    }

                    restarts += 1;
                    let total = self.recovered.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(
                        "Entity {} crashed, restarting in {:?} (restart {}, total {})",
                        self.id,
                        backoff,
                        restarts,
                        total
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.policy.max_backoff);

                    if self.stop_requested.load(Ordering::SeqCst) {
                        break;
                    }

                    if let Err(e) = self.obj.init() {
                        tracing::error!("Entity {} failed to re-init: {:#}", self.id, e);
                        self.failed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Entity {} run cancelled: {}", self.id, e);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn recovered(&self) -> u32 {
        self.recovered.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once the restart budget was exhausted or a re-init failed.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
