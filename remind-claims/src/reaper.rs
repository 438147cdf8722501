use anyhow::Result;
use remind_core::config::SchedulingConfig;
use remind_core::NotificationRepo;
use std::sync::Arc;
use std::time::Duration;
use tracing;

/// Hands back claims that outlived the reaper timeout without a `sent` commit.
///
/// This is the only recovery path for a worker that died between claim and
/// commit. `SchedulingConfig::validate` guarantees the timeout outlasts a
/// full retry sequence, so a live delivery is never released under it.
pub struct Reaper {
    store: Arc<dyn NotificationRepo>,
    interval: Duration,
    timeout: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn NotificationRepo>, scheduling: &SchedulingConfig) -> Self {
        Self {
            store,
            interval: scheduling.reaper_interval,
            timeout: scheduling.reaper_timeout,
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Starting stale-claim reaper (every {:?}, timeout {:?})",
            self.interval,
            self.timeout
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                crate::log_loop_error("Reaper sweep", &e);
            }
        }
    }

    pub async fn sweep(&self) -> Result<u64> {
        let released = self.store.release_stale(self.timeout).await?;
        if released > 0 {
            tracing::warn!("Released {} stale claims", released);
        } else {
            tracing::debug!("No stale claims");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use remind_core::types::NewNotification;
    use remind_core::MemoryStore;

    #[tokio::test]
    async fn releases_crashed_claim_for_the_next_tick() {
        let store = Arc::new(MemoryStore::new());
        let n = store
            .insert(&NewNotification::one_time(
                "+15550001234",
                "dentist",
                Utc::now() - ChronoDuration::minutes(30),
            ))
            .await
            .unwrap();
        let scheduling = SchedulingConfig::default();
        store.claim_due(10, scheduling.claim_staleness).await.unwrap();

        let reaper = Reaper::new(store.clone(), &scheduling);
        assert_eq!(reaper.sweep().await.unwrap(), 0);

        store.set_claimed_at(n.id, Some(Utc::now() - ChronoDuration::minutes(6)));
        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let reclaimed = store.claim_due(10, scheduling.claim_staleness).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, n.id);
    }

    #[tokio::test]
    async fn sent_notifications_are_never_released() {
        let store = Arc::new(MemoryStore::new());
        let n = store
            .insert(&NewNotification::one_time(
                "+15550001234",
                "dentist",
                Utc::now() - ChronoDuration::minutes(30),
            ))
            .await
            .unwrap();
        store.set_claimed_at(n.id, Some(Utc::now() - ChronoDuration::hours(1)));
        store.commit_sent(n.id).await.unwrap();

        let reaper = Reaper::new(store.clone(), &SchedulingConfig::default());
        assert_eq!(reaper.sweep().await.unwrap(), 0);
        let row = store.get(n.id).await.unwrap().unwrap();
        assert!(row.sent);
        assert!(row.claimed_at.is_some());
    }
}
