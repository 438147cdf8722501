use anyhow::Result;
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use remind_core::{DeliveryJob, RedpandaConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing;

use crate::worker::DeliveryWorker;

/// Deliveries running concurrently, capped at `limit`. One recipient's
/// backoff sleep does not hold up the jobs behind it.
struct InFlight {
    set: JoinSet<()>,
    limit: usize,
}

impl InFlight {
    fn new(limit: usize) -> Self {
        Self {
            set: JoinSet::new(),
            limit: limit.max(1),
        }
    }

    async fn spawn(&mut self, worker: Arc<DeliveryWorker>, job: DeliveryJob) {
        while self.set.try_join_next().is_some() {}
        while self.set.len() >= self.limit {
            if let Some(Err(e)) = self.set.join_next().await {
                tracing::error!("Delivery task panicked: {}", e);
            }
        }
        self.set.spawn(async move {
            if let Err(e) = worker.deliver(&job).await {
                tracing::error!("Delivery of notification {} failed: {}", job.notification_id, e);
            }
        });
    }

    #[cfg(test)]
    async fn drain(&mut self) {
        while self.set.join_next().await.is_some() {}
    }
}

/// Consumes delivery jobs from Redpanda and runs up to `workers` of them at
/// once through the worker.
///
/// Offsets are auto-committed: a job lost to a crash is recovered from the
/// store by the reaper, and a duplicate job is caught by the locked re-check.
pub async fn run(
    consumer: RedpandaConsumer,
    topic: &str,
    worker: Arc<DeliveryWorker>,
    workers: usize,
) -> Result<()> {
    tracing::info!("Starting delivery consumer ({} concurrent deliveries)", workers.max(1));
    let mut in_flight = InFlight::new(workers);

    consumer.subscribe(&[topic])?;
    tracing::info!("Subscribed to topic: {}", topic);

    let mut error_count = 0u32;
    let mut last_error_log = std::time::Instant::now();

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                let Some(payload) = message.payload() else {
                    continue;
                };
                match decode_job(payload) {
                    Ok(job) => in_flight.spawn(worker.clone(), job).await,
                    Err(e) => {
                        tracing::error!("Dropping undecodable delivery job: {}", e);
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                if last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving message from Redpanda (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = std::time::Instant::now();
                }
                let backoff = Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn decode_job(payload: &[u8]) -> Result<DeliveryJob> {
    Ok(serde_json::from_slice(payload)?)
}
