//! Replay of work missed while an entity had no owner.

use crate::store::Retriever;
use crate::store::types::{ActionType, App, ScheduleStatus};

use chrono::{DateTime, Duration, Timelike, Utc};

/// Statuses meaning "should have run but didn't".
pub const RECONCILE_STATUSES: [ScheduleStatus; 2] = [ScheduleStatus::Scheduled, ScheduleStatus::Miss];

/// One-minute buckets from `offset_minutes` back up to the current minute,
/// oldest first.
pub fn time_buckets(now: DateTime<Utc>, offset_minutes: u32) -> Vec<DateTime<Utc>> {
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    (0..=offset_minutes)
        .rev()
        .map(|back| minute - Duration::minutes(i64::from(back)))
        .collect()
}

/// Runs a `Reconcile` bulk action for every bucket. A failing bucket is logged
/// and skipped. Returns the number of buckets attempted.
pub async fn reconcile_partition(
    retriever: &dyn Retriever,
    app: &App,
    partition: u32,
    now: DateTime<Utc>,
    offset_minutes: u32,
) -> usize {
    let buckets = time_buckets(now, offset_minutes);

    for bucket in &buckets {
        if let Err(e) = retriever
            .bulk_action(app, partition, *bucket, &RECONCILE_STATUSES, ActionType::Reconcile)
            .await
        {
            tracing::warn!(
                "Reconciliation of {}.{} for bucket {} failed: {:#}",
                app.app_id,
                partition,
                bucket,
                e
            );
        }
    }

    tracing::info!(
        "Reconciled {}.{} over {} bucket(s)",
        app.app_id,
        partition,
        buckets.len()
    );
    buckets.len()
}
