use remind_core::config::{RetryPolicy, SchedulingConfig};
use remind_core::repos::{SendFuture, SendOnce};
use remind_core::types::{mask_recipient, Notification};
use remind_core::{DeliveryJob, DeliveryStatus, GatewayError, LockedSend, NotificationRepo, SmsGateway, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing;

use crate::followup::FollowupLog;
use crate::message::format_reminder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { attempts: u32 },
    /// Another worker committed it first.
    AlreadySent,
    /// Cancelled before the row lock was taken.
    Missing,
}

/// Why a delivery job did not end in a committed send.
///
/// Only `CommitAfterSend` means the user already has the SMS; it must never
/// lead to another send.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("store error before send: {0}")]
    Store(#[from] StoreError),

    #[error("gateway failed after {attempts} attempt(s): {source}")]
    Gateway { attempts: u32, source: GatewayError },

    #[error("notification {id} was delivered but could not be marked sent: {reason}")]
    CommitAfterSend { id: i64, reason: String },
}

/// Sends one claimed notification and commits `sent` under the same row lock.
pub struct DeliveryWorker {
    store: Arc<dyn NotificationRepo>,
    gateway: Arc<dyn SmsGateway>,
    followups: Arc<dyn FollowupLog>,
    retry: RetryPolicy,
    gateway_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn NotificationRepo>,
        gateway: Arc<dyn SmsGateway>,
        followups: Arc<dyn FollowupLog>,
        scheduling: &SchedulingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            followups,
            retry: scheduling.retry,
            gateway_timeout: scheduling.gateway_timeout,
        }
    }

    pub async fn deliver(&self, job: &DeliveryJob) -> Result<DeliveryOutcome, DeliveryError> {
        let id = job.notification_id;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::debug!("Delivering notification {} (attempt {}/{})", id, attempt, max_attempts);

            match self.store.send_and_commit(id, self.send_once()).await? {
                LockedSend::Missing => {
                    tracing::info!("Notification {} no longer exists, nothing to send", id);
                    return Ok(DeliveryOutcome::Missing);
                }
                LockedSend::AlreadySent => {
                    tracing::warn!("Notification {} already sent, skipping duplicate job", id);
                    return Ok(DeliveryOutcome::AlreadySent);
                }
                LockedSend::Sent => {
                    self.after_send(job).await;
                    tracing::info!(
                        "Notification {} sent to {} after {} attempt(s)",
                        id,
                        mask_recipient(&job.recipient),
                        attempt
                    );
                    return Ok(DeliveryOutcome::Sent { attempts: attempt });
                }
                LockedSend::CommitFailed(cause) => {
                    return self.recover_commit(job, attempt, cause).await;
                }
                LockedSend::GatewayFailed(error) => {
                    if let Err(e) = self
                        .store
                        .record_delivery(id, DeliveryStatus::Failed, Some(&error.to_string()))
                        .await
                    {
                        tracing::error!("Failed to record delivery failure for {}: {}", id, e);
                    }

                    if !error.is_transient() {
                        tracing::error!("Notification {} rejected permanently: {}", id, error);
                        self.store.mark_failed(id, &error.to_string()).await?;
                        return Err(DeliveryError::Gateway { attempts: attempt, source: error });
                    }

                    if attempt >= max_attempts {
                        // Stays claimed; the reaper releases it once the claim goes stale.
                        tracing::warn!(
                            "Giving up on notification {} after {} attempts: {}",
                            id,
                            attempt,
                            error
                        );
                        return Err(DeliveryError::Gateway { attempts: attempt, source: error });
                    }

                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Attempt {} for notification {} failed, retrying in {:?}: {}",
                        attempt,
                        id,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// The gateway call run while the row is locked. Uses the locked row, not
    /// the job, so an edit made after dispatch is what goes out.
    fn send_once(&self) -> SendOnce<'static> {
        let gateway = self.gateway.clone();
        let timeout = self.gateway_timeout;

        Box::new(move |notification: Notification| -> SendFuture<'static> {
            Box::pin(async move {
                let body = format_reminder(notification.id, &notification.payload_text);
                match tokio::time::timeout(timeout, gateway.send(&notification.recipient, &body)).await {
                    Ok(Ok(sid)) => {
                        tracing::debug!("Gateway accepted notification {} ({})", notification.id, sid);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(GatewayError::Transient(format!(
                        "gateway timed out after {:?}",
                        timeout
                    ))),
                }
            })
        })
    }

    /// The SMS is out but `sent = true` was lost. One fallback write on a
    /// fresh connection, then escalate. Never sends again.
    async fn recover_commit(
        &self,
        job: &DeliveryJob,
        attempts: u32,
        cause: StoreError,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let id = job.notification_id;
        tracing::warn!("Notification {} sent but commit failed ({}), trying fallback write", id, cause);

        match self.store.commit_sent(id).await {
            Ok(found) => {
                if !found {
                    tracing::warn!("Notification {} was deleted after it was sent", id);
                }
                self.after_send(job).await;
                Ok(DeliveryOutcome::Sent { attempts })
            }
            Err(e) => {
                tracing::error!(
                    "RECONCILE notification {} to {} was delivered but is not marked sent: {} (first failure: {})",
                    id,
                    mask_recipient(&job.recipient),
                    e,
                    cause
                );
                let reason = format!("{}; fallback: {}", cause, e);
                if let Err(dl) = self.store.record_dead_letter(id, &job.recipient, &reason).await {
                    tracing::error!("RECONCILE failed to write dead letter for {}: {}", id, dl);
                }
                Err(DeliveryError::CommitAfterSend { id, reason })
            }
        }
    }

    /// Best-effort bookkeeping. Failures are logged and never retried.
    async fn after_send(&self, job: &DeliveryJob) {
        if let Err(e) = self.followups.record(&job.recipient, job.notification_id).await {
            tracing::error!("Failed to update last sent reminder for {}: {}", mask_recipient(&job.recipient), e);
        }
        if let Err(e) = self
            .store
            .record_delivery(job.notification_id, DeliveryStatus::Sent, None)
            .await
        {
            tracing::error!("Failed to record delivery metrics for {}: {}", job.notification_id, e);
        }
    }
}
