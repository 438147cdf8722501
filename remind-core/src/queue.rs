use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::QueueError;
use crate::redpanda::{produce_message, RedpandaProducer};
use crate::types::DeliveryJob;

/// Hands claimed notifications to delivery workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &DeliveryJob) -> Result<(), QueueError>;
}

pub struct RedpandaQueue {
    producer: RedpandaProducer,
    topic: String,
}

impl RedpandaQueue {
    pub fn new(producer: RedpandaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl JobQueue for RedpandaQueue {
    async fn enqueue(&self, job: &DeliveryJob) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(job)?;
        // Keyed by recipient so one user's jobs stay on one partition.
        produce_message(&self.producer, &self.topic, Some(&job.recipient), &payload)
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))
    }
}

/// In-process queue feeding a local worker pool.
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<DeliveryJob>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DeliveryJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, job: &DeliveryJob) -> Result<(), QueueError> {
        self.sender
            .send(job.clone())
            .await
            .map_err(|_| QueueError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn job(id: i64) -> DeliveryJob {
        DeliveryJob {
            notification_id: id,
            recipient: "+15550001111".to_string(),
            payload_text: "water the plants".to_string(),
        }
    }

    #[tokio::test]
    async fn channel_queue_delivers_in_order() {
        let (queue, mut rx) = ChannelQueue::new(4);
        queue.enqueue(&job(1)).await.unwrap();
        queue.enqueue(&job(2)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().notification_id, 1);
        assert_eq!(rx.recv().await.unwrap().notification_id, 2);
    }

    #[tokio::test]
    async fn channel_queue_reports_closed_receiver() {
        let (queue, rx) = ChannelQueue::new(1);
        drop(rx);
        assert_matches!(queue.enqueue(&job(1)).await, Err(QueueError::Closed));
    }
}
