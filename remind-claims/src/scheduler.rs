use anyhow::Result;
use remind_core::config::SchedulingConfig;
use remind_core::types::mask_recipient;
use remind_core::{DeliveryJob, JobQueue, NotificationRepo};
use std::sync::Arc;
use std::time::Duration;
use tracing;

/// Claims due notifications on a fixed tick and hands each one to the
/// delivery queue. Holds no state between ticks.
pub struct ClaimScheduler {
    store: Arc<dyn NotificationRepo>,
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    batch_size: i64,
    staleness: Duration,
}

/// Per-tick counts, logged and returned for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub dispatched: usize,
}

impl ClaimScheduler {
    pub fn new(store: Arc<dyn NotificationRepo>, queue: Arc<dyn JobQueue>, scheduling: &SchedulingConfig) -> Self {
        Self {
            store,
            queue,
            interval: scheduling.claim_interval,
            batch_size: scheduling.claim_batch_size,
            staleness: scheduling.claim_staleness,
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Starting claim scheduler (every {:?}, batch {})",
            self.interval,
            self.batch_size
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                // Nothing was claimed: claim_due rolls back on error.
                crate::log_loop_error("Claim tick", &e);
            }
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let claimed = self.store.claim_due(self.batch_size, self.staleness).await?;

        if claimed.is_empty() {
            tracing::debug!("No due notifications");
            return Ok(TickReport::default());
        }

        let mut report = TickReport {
            claimed: claimed.len(),
            dispatched: 0,
        };

        for notification in &claimed {
            let job = DeliveryJob::from(notification);
            match self.queue.enqueue(&job).await {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    // Left claimed; the reaper hands it back once the claim goes stale.
                    tracing::warn!(
                        "Failed to dispatch notification {} for {}: {}",
                        notification.id,
                        mask_recipient(&notification.recipient),
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Claimed {} notifications, dispatched {}",
            report.claimed,
            report.dispatched
        );
        Ok(report)
    }
}
