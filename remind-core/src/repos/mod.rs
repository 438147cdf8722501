mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use std::time::Duration;

use crate::error::{GatewayError, StoreError};
use crate::types::{
    DeliveryStatus, DigestSubscriber, NewNotification, NewRecurringDefinition, Notification,
    RecurringDefinition,
};

pub type SendFuture<'a> = BoxFuture<'a, Result<(), GatewayError>>;

/// The gateway call run while the notification row is locked.
pub type SendOnce<'a> = Box<dyn FnOnce(Notification) -> SendFuture<'a> + Send + 'a>;

/// Result of one locked re-check → send → mark-sent scope.
#[derive(Debug)]
pub enum LockedSend {
    /// Row deleted (cancelled) before the lock was taken.
    Missing,
    /// Another worker already committed it.
    AlreadySent,
    /// Sent and marked sent in the same transaction.
    Sent,
    /// Gateway refused; the transaction rolled back and the lock is released.
    GatewayFailed(GatewayError),
    /// The SMS left the building but `sent = true` did not persist.
    CommitFailed(StoreError),
}

#[async_trait]
pub trait NotificationRepo: Send + Sync {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Notification>, StoreError>;

    /// Cancellation by the action layer. Returns whether a row was removed.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    /// Claims up to `batch_size` due, unsent rows that are unclaimed or whose
    /// claim is older than `staleness`. Rows locked by another transaction are
    /// skipped, never waited on.
    async fn claim_due(&self, batch_size: i64, staleness: Duration) -> Result<Vec<Notification>, StoreError>;

    /// Locks the row, re-checks `sent`, runs `send`, and marks it sent before
    /// the lock is released.
    async fn send_and_commit<'a>(&self, id: i64, send: SendOnce<'a>) -> Result<LockedSend, StoreError>;

    /// Marks a row sent outside any claim. Only used as the fallback after a
    /// failed commit, so it deliberately ignores `claimed_at`.
    async fn commit_sent(&self, id: i64) -> Result<bool, StoreError>;

    /// Clears the claim of an unsent row.
    async fn release(&self, id: i64) -> Result<bool, StoreError>;

    /// Clears every claim older than `timeout` on an unsent row.
    async fn release_stale(&self, timeout: Duration) -> Result<u64, StoreError>;

    /// Parks a row after a permanent gateway error so it is neither claimed nor reaped.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError>;

    async fn record_delivery(&self, id: i64, status: DeliveryStatus, error: Option<&str>) -> Result<(), StoreError>;

    async fn record_dead_letter(&self, id: i64, recipient: &str, error: &str) -> Result<(), StoreError>;

    /// Notifications due for `recipient` in `[start, end)`, ordered by due time.
    async fn for_recipient_between(
        &self,
        recipient: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Notification>, StoreError>;
}

#[async_trait]
pub trait RecurringRepo: Send + Sync {
    async fn create_recurring(&self, new: &NewRecurringDefinition) -> Result<RecurringDefinition, StoreError>;

    async fn get_recurring(&self, id: i64) -> Result<Option<RecurringDefinition>, StoreError>;

    async fn list_active(&self) -> Result<Vec<RecurringDefinition>, StoreError>;

    /// Stops future expansion. Rows already created stay untouched.
    async fn deactivate(&self, id: i64) -> Result<bool, StoreError>;

    /// Inserts the occurrence unless `(definition.id, due_at)` already exists.
    /// Returns `None` when it did.
    async fn insert_occurrence(
        &self,
        definition: &RecurringDefinition,
        due_at: DateTime<Utc>,
    ) -> Result<Option<Notification>, StoreError>;

    async fn mark_generated(&self, id: i64, due_at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DigestRepo: Send + Sync {
    async fn digest_subscribers(&self) -> Result<Vec<DigestSubscriber>, StoreError>;

    /// Moves `last_digest_sent_date` forward to `day`. `false` means another
    /// poller already claimed this day (or a later one).
    async fn claim_digest_day(&self, recipient: &str, day: NaiveDate) -> Result<bool, StoreError>;
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}
