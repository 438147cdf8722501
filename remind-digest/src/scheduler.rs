use anyhow::{anyhow, Result};
use chrono::{DateTime, Days, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use remind_core::config::SchedulingConfig;
use remind_core::types::{mask_recipient, DigestSubscriber};
use remind_core::{DigestRepo, NotificationRepo, SmsGateway};
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::format::{format_digest, DigestItem};

/// Sends each subscriber one digest per local calendar day.
///
/// Several pollers may run at once: the day is claimed with a conditional
/// update before anything is sent, so only one of them proceeds.
pub struct DigestScheduler {
    users: Arc<dyn DigestRepo>,
    notifications: Arc<dyn NotificationRepo>,
    gateway: Arc<dyn SmsGateway>,
    poll_interval: Duration,
    gateway_timeout: Duration,
}

/// Due once the local clock reaches `digest_time` and today has not been
/// claimed yet. A tick that overran the exact minute still catches up later
/// the same day; the day claim keeps it to one send.
fn is_due(now: NaiveTime, digest_time: NaiveTime, last_sent: Option<NaiveDate>, today: NaiveDate) -> bool {
    now >= digest_time && last_sent.map(|last| last < today).unwrap_or(true)
}

fn start_of_day(tz: Tz, day: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = day.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + ChronoDuration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

impl DigestScheduler {
    pub fn new(
        users: Arc<dyn DigestRepo>,
        notifications: Arc<dyn NotificationRepo>,
        gateway: Arc<dyn SmsGateway>,
        scheduling: &SchedulingConfig,
    ) -> Self {
        Self {
            users,
            notifications,
            gateway,
            poll_interval: scheduling.digest_poll_interval,
            gateway_timeout: scheduling.gateway_timeout,
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting daily digest scheduler (every {:?})", self.poll_interval);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!("Digest tick failed: {}", e);
            }
        }
    }

    /// Returns how many digests this poller sent.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let subscribers = self.users.digest_subscribers().await?;
        let mut sent = 0;

        for subscriber in &subscribers {
            match self.process(subscriber, now).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "Error sending daily digest to {}: {}",
                        mask_recipient(&subscriber.recipient),
                        e
                    );
                }
            }
        }

        if sent > 0 {
            tracing::info!("Sent {} daily digests", sent);
        } else {
            tracing::debug!("No daily digests due");
        }
        Ok(sent)
    }

    async fn process(&self, subscriber: &DigestSubscriber, now: DateTime<Utc>) -> Result<bool> {
        let tz: Tz = subscriber
            .timezone
            .parse()
            .map_err(|_| anyhow!("unknown timezone '{}'", subscriber.timezone))?;
        let local = now.with_timezone(&tz);
        let today = local.date_naive();

        if !is_due(local.time(), subscriber.digest_time, subscriber.last_digest_sent_date, today) {
            return Ok(false);
        }
        if !self.users.claim_digest_day(&subscriber.recipient, today).await? {
            tracing::debug!(
                "Digest for {} on {} already claimed",
                mask_recipient(&subscriber.recipient),
                today
            );
            return Ok(false);
        }

        let start = start_of_day(tz, today).ok_or_else(|| anyhow!("no start of day for {}", today))?;
        let tomorrow = today
            .checked_add_days(Days::new(1))
            .ok_or_else(|| anyhow!("date overflow after {}", today))?;
        let end = start_of_day(tz, tomorrow).ok_or_else(|| anyhow!("no start of day for {}", tomorrow))?;

        let items: Vec<DigestItem> = self
            .notifications
            .for_recipient_between(&subscriber.recipient, start, end)
            .await?
            .into_iter()
            .map(|n| DigestItem {
                local_time: n.due_at.with_timezone(&tz).time(),
                text: n.payload_text,
            })
            .collect();

        let body = format_digest(subscriber.first_name.as_deref(), today, &items);

        // The day is already claimed: a failed send is logged, not retried.
        match tokio::time::timeout(self.gateway_timeout, self.gateway.send(&subscriber.recipient, &body)).await {
            Ok(Ok(_)) => {
                tracing::info!(
                    "Sent daily digest to {} ({} reminders)",
                    mask_recipient(&subscriber.recipient),
                    items.len()
                );
                Ok(true)
            }
            Ok(Err(e)) => Err(anyhow!("gateway refused digest: {}", e)),
            Err(_) => Err(anyhow!("gateway timed out after {:?}", self.gateway_timeout)),
        }
    }
}
