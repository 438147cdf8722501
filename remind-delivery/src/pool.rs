use anyhow::Result;
use remind_core::DeliveryJob;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing;

use crate::worker::DeliveryWorker;

/// Runs `workers` delivery loops over the in-process job channel. Returns
/// once the channel is closed and drained.
pub async fn run(worker: Arc<DeliveryWorker>, receiver: mpsc::Receiver<DeliveryJob>, workers: usize) -> Result<()> {
    let workers = workers.max(1);
    tracing::info!("Starting local delivery pool with {} workers", workers);

    let receiver = Arc::new(Mutex::new(receiver));
    let mut set = JoinSet::new();

    for slot in 0..workers {
        let worker = worker.clone();
        let receiver = receiver.clone();
        set.spawn(async move {
            loop {
                let job = { receiver.lock().await.recv().await };
                let Some(job) = job else {
                    tracing::debug!("Delivery worker {} stopping, queue closed", slot);
                    break;
                };
                if let Err(e) = worker.deliver(&job).await {
                    tracing::error!("Delivery of notification {} failed: {}", job.notification_id, e);
                }
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        joined?;
    }
    Ok(())
}
