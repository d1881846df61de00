//! Schedule Poller
//!
//! The work entity the binary runs: once per tick it asks the partition's retriever to
//! trigger the schedules due in the current minute bucket.

use crate::store::types::{ActionType, App, EntityId, ScheduleStatus};
use crate::store::{ClusterStore, EntityFactory, Retriever};
use crate::supervisor::entity::Entity;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Polls the schedules of one app partition.
pub struct SchedulePoller {
    id: EntityId,
    partition: u32,
    store: Arc<dyn ClusterStore>,
    retriever: Arc<dyn Retriever>,
    interval: Duration,
    stop: Notify,
}

impl SchedulePoller {
    pub fn new(
        id: EntityId,
        store: Arc<dyn ClusterStore>,
        retriever: Arc<dyn Retriever>,
        interval: Duration,
    ) -> anyhow::Result<Self> {
        let partition = id
            .partition()
            .ok_or_else(|| anyhow::anyhow!("{} has no partition index", id))?;

        Ok(Self {
            id,
            partition,
            store,
            retriever,
            interval,
            stop: Notify::new(),
        })
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let app = self.store.get_app(self.id.app_id()).await?;
        if !app.active {
            tracing::debug!("Poller {} idle: app {} inactive", self.id, app.app_id);
            return Ok(());
        }

        self.retriever
            .bulk_action(
                &app,
                self.partition,
                Utc::now(),
                &[ScheduleStatus::Scheduled],
                ActionType::Trigger,
            )
            .await
    }
}

#[async_trait]
impl Entity for SchedulePoller {
    fn init(&self) -> anyhow::Result<()> {
        tracing::debug!("Poller {} initialised (every {:?})", self.id, self.interval);
        Ok(())
    }

    async fn start(&self) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!("Poller {} tick failed: {:#}", self.id, e);
                    }
                }
                _ = self.stop.notified() => {
                    tracing::debug!("Poller {} stopped", self.id);
                    break;
                }
            }
        }
    }

    fn stop(&self) {
        self.stop.notify_one();
    }
}

/// Retriever that only logs what it was asked to do. Stands in for the
/// schedule storage, which lives outside this crate.
#[derive(Default)]
pub struct LoggingRetriever {
    actions: AtomicU64,
}

impl LoggingRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> u64 {
        self.actions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Retriever for LoggingRetriever {
    async fn bulk_action(
        &self,
        app: &App,
        partition: u32,
        time_bucket: DateTime<Utc>,
        statuses: &[ScheduleStatus],
        action: ActionType,
    ) -> anyhow::Result<()> {
        self.actions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "{:?} {}.{} bucket {} statuses {:?}",
            action,
            app.app_id,
            partition,
            time_bucket.format("%Y-%m-%d %H:%M"),
            statuses
        );
        Ok(())
    }
}

/// Builds a `SchedulePoller` per entity, all sharing one retriever.
pub struct PollerFactory {
    store: Arc<dyn ClusterStore>,
    retriever: Arc<dyn Retriever>,
    interval: Duration,
}

impl PollerFactory {
    pub fn new(store: Arc<dyn ClusterStore>, retriever: Arc<dyn Retriever>, interval: Duration) -> Self {
        Self {
            store,
            retriever,
            interval,
        }
    }
}

impl EntityFactory for PollerFactory {
    fn create_entity(&self, id: &EntityId) -> anyhow::Result<Arc<dyn Entity>> {
        let poller = SchedulePoller::new(
            id.clone(),
            self.store.clone(),
            self.retriever.clone(),
            self.interval,
        )?;
        Ok(Arc::new(poller))
    }

    fn entity_retriever(&self, _app_id: &str) -> Arc<dyn Retriever> {
        self.retriever.clone()
    }
}
