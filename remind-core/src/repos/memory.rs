use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use super::{chrono_duration, DigestRepo, LockedSend, NotificationRepo, RecurringRepo, SendOnce};
use crate::error::StoreError;
use crate::types::{
    DeliveryStatus, DigestSubscriber, NewNotification, NewRecurringDefinition, Notification,
    RecurringDefinition,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub notification_id: i64,
    pub recipient: String,
    pub error: String,
}

struct Row {
    notification: Notification,
    failed_at: Option<DateTime<Utc>>,
    delivery_status: Option<DeliveryStatus>,
    error_message: Option<String>,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<i64, Row>,
    row_locks: HashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    recurring: BTreeMap<i64, RecurringDefinition>,
    subscribers: BTreeMap<String, DigestSubscriber>,
    dead_letters: Vec<DeadLetter>,
    next_id: i64,
    next_recurring_id: i64,
    failing_commits: usize,
    unavailable: bool,
}

impl State {
    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn row_lock(&mut self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks.entry(id).or_default().clone()
    }

    fn is_locked(&self, id: i64) -> bool {
        self.row_locks
            .get(&id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    fn insert_row(&mut self, new: &NewNotification) -> Notification {
        self.next_id += 1;
        let notification = Notification {
            id: self.next_id,
            recipient: new.recipient.clone(),
            payload_text: new.payload_text.clone(),
            due_at: new.due_at,
            sent: false,
            claimed_at: None,
            source_recurrence_id: new.source_recurrence_id,
        };
        self.rows.insert(
            notification.id,
            Row {
                notification: notification.clone(),
                failed_at: None,
                delivery_status: None,
                error_message: None,
            },
        );
        notification
    }

    fn take_commit_failure(&mut self) -> bool {
        if self.failing_commits > 0 {
            self.failing_commits -= 1;
            return true;
        }
        false
    }
}

/// In-process store with the same claim and lock semantics as [`super::PgStore`].
///
/// Each notification has its own async mutex standing in for the Postgres row
/// lock: `send_and_commit` holds it across the gateway call and `claim_due`
/// skips rows whose lock is taken.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `n` commits (in-transaction or fallback) fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.state().failing_commits = n;
    }

    /// Every operation returns `StoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn set_claimed_at(&self, id: i64, claimed_at: Option<DateTime<Utc>>) {
        if let Some(row) = self.state().rows.get_mut(&id) {
            row.notification.claimed_at = claimed_at;
        }
    }

    /// Takes the row lock the way a concurrent transaction would.
    pub async fn hold_row_lock(&self, id: i64) -> OwnedMutexGuard<()> {
        let lock = self.state().row_lock(id);
        lock.lock_owned().await
    }

    pub fn upsert_subscriber(&self, subscriber: DigestSubscriber) {
        self.state()
            .subscribers
            .insert(subscriber.recipient.clone(), subscriber);
    }

    pub fn subscriber(&self, recipient: &str) -> Option<DigestSubscriber> {
        self.state().subscribers.get(recipient).cloned()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    pub fn delivery_status(&self, id: i64) -> Option<(DeliveryStatus, Option<String>)> {
        let state = self.state();
        let row = state.rows.get(&id)?;
        row.delivery_status.map(|status| (status, row.error_message.clone()))
    }

    pub fn is_failed(&self, id: i64) -> bool {
        self.state()
            .rows
            .get(&id)
            .map(|row| row.failed_at.is_some())
            .unwrap_or(false)
    }

    pub fn all(&self) -> Vec<Notification> {
        self.state()
            .rows
            .values()
            .map(|row| row.notification.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationRepo for MemoryStore {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, StoreError> {
        let mut state = self.state();
        state.check()?;
        Ok(state.insert_row(new))
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        let state = self.state();
        state.check()?;
        Ok(state.rows.get(&id).map(|row| row.notification.clone()))
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let lock = {
            let mut state = self.state();
            state.check()?;
            state.row_lock(id)
        };
        let _guard = lock.lock_owned().await;
        let mut state = self.state();
        state.row_locks.remove(&id);
        Ok(state.rows.remove(&id).is_some())
    }

    async fn claim_due(&self, batch_size: i64, staleness: Duration) -> Result<Vec<Notification>, StoreError> {
        let mut state = self.state();
        state.check()?;
        let now = Utc::now();
        let cutoff = now - chrono_duration(staleness);
        let limit = usize::try_from(batch_size).unwrap_or(0);

        let mut candidates: Vec<(DateTime<Utc>, i64)> = state
            .rows
            .values()
            .filter(|row| {
                let n = &row.notification;
                n.due_at <= now
                    && !n.sent
                    && row.failed_at.is_none()
                    && n.claimed_at.map(|at| at < cutoff).unwrap_or(true)
            })
            .map(|row| (row.notification.due_at, row.notification.id))
            .collect();
        candidates.sort();

        let ids: Vec<i64> = candidates
            .into_iter()
            .map(|(_, id)| id)
            .filter(|id| !state.is_locked(*id))
            .take(limit)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = state.rows.get_mut(&id) {
                row.notification.claimed_at = Some(now);
                claimed.push(row.notification.clone());
            }
        }
        Ok(claimed)
    }

    async fn send_and_commit<'a>(&self, id: i64, send: SendOnce<'a>) -> Result<LockedSend, StoreError> {
        let lock = {
            let mut state = self.state();
            state.check()?;
            state.row_lock(id)
        };
        let _guard = lock.lock_owned().await;

        let notification = {
            let state = self.state();
            state.check()?;
            match state.rows.get(&id) {
                None => return Ok(LockedSend::Missing),
                Some(row) if row.notification.sent => return Ok(LockedSend::AlreadySent),
                Some(row) => row.notification.clone(),
            }
        };

        if let Err(e) = send(notification).await {
            return Ok(LockedSend::GatewayFailed(e));
        }

        let mut state = self.state();
        if state.take_commit_failure() {
            return Ok(LockedSend::CommitFailed(StoreError::Unavailable(
                "commit lost".to_string(),
            )));
        }
        match state.rows.get_mut(&id) {
            Some(row) => {
                row.notification.sent = true;
                Ok(LockedSend::Sent)
            }
            None => Ok(LockedSend::CommitFailed(StoreError::NotFound(id))),
        }
    }

    async fn commit_sent(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.check()?;
        if state.take_commit_failure() {
            return Err(StoreError::Unavailable("commit lost".to_string()));
        }
        match state.rows.get_mut(&id) {
            Some(row) => {
                row.notification.sent = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.check()?;
        match state.rows.get_mut(&id) {
            Some(row) if !row.notification.sent => {
                row.notification.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale(&self, timeout: Duration) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.check()?;
        let cutoff = Utc::now() - chrono_duration(timeout);

        let stale: Vec<i64> = state
            .rows
            .values()
            .filter(|row| {
                let n = &row.notification;
                !n.sent && row.failed_at.is_none() && n.claimed_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|row| row.notification.id)
            .filter(|id| !state.is_locked(*id))
            .collect();

        for id in &stale {
            if let Some(row) = state.rows.get_mut(id) {
                row.notification.claimed_at = None;
            }
        }
        Ok(stale.len() as u64)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check()?;
        if let Some(row) = state.rows.get_mut(&id) {
            if !row.notification.sent {
                row.failed_at = Some(Utc::now());
                row.delivery_status = Some(DeliveryStatus::Failed);
                row.error_message = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn record_delivery(&self, id: i64, status: DeliveryStatus, error: Option<&str>) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check()?;
        if let Some(row) = state.rows.get_mut(&id) {
            row.delivery_status = Some(status);
            row.error_message = error.map(str::to_string);
        }
        Ok(())
    }

    async fn record_dead_letter(&self, id: i64, recipient: &str, error: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check()?;
        state.dead_letters.push(DeadLetter {
            notification_id: id,
            recipient: recipient.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn for_recipient_between(
        &self,
        recipient: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Notification>, StoreError> {
        let state = self.state();
        state.check()?;
        let mut found: Vec<Notification> = state
            .rows
            .values()
            .map(|row| &row.notification)
            .filter(|n| n.recipient == recipient && n.due_at >= start && n.due_at < end)
            .cloned()
            .collect();
        found.sort_by_key(|n| (n.due_at, n.id));
        Ok(found)
    }
}

#[async_trait]
impl RecurringRepo for MemoryStore {
    async fn create_recurring(&self, new: &NewRecurringDefinition) -> Result<RecurringDefinition, StoreError> {
        let mut state = self.state();
        state.check()?;
        state.next_recurring_id += 1;
        let definition = RecurringDefinition {
            id: state.next_recurring_id,
            recipient: new.recipient.clone(),
            payload_text: new.payload_text.clone(),
            recurrence_type: new.recurrence_type.clone(),
            recurrence_day: new.recurrence_day,
            local_time: new.local_time,
            timezone: new.timezone.clone(),
            active: true,
            last_generated_at: None,
        };
        state.recurring.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn get_recurring(&self, id: i64) -> Result<Option<RecurringDefinition>, StoreError> {
        let state = self.state();
        state.check()?;
        Ok(state.recurring.get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<RecurringDefinition>, StoreError> {
        let state = self.state();
        state.check()?;
        Ok(state.recurring.values().filter(|d| d.active).cloned().collect())
    }

    async fn deactivate(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.check()?;
        match state.recurring.get_mut(&id) {
            Some(definition) => {
                definition.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_occurrence(
        &self,
        definition: &RecurringDefinition,
        due_at: DateTime<Utc>,
    ) -> Result<Option<Notification>, StoreError> {
        // Check and insert under one guard, like the unique index.
        let mut state = self.state();
        state.check()?;
        let exists = state.rows.values().any(|row| {
            row.notification.source_recurrence_id == Some(definition.id)
                && row.notification.due_at == due_at
        });
        if exists {
            return Ok(None);
        }
        let new = NewNotification {
            recipient: definition.recipient.clone(),
            payload_text: definition.payload_text.clone(),
            due_at,
            source_recurrence_id: Some(definition.id),
        };
        Ok(Some(state.insert_row(&new)))
    }

    async fn mark_generated(&self, id: i64, due_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check()?;
        if let Some(definition) = state.recurring.get_mut(&id) {
            definition.last_generated_at = Some(due_at);
        }
        Ok(())
    }
}

#[async_trait]
impl DigestRepo for MemoryStore {
    async fn digest_subscribers(&self) -> Result<Vec<DigestSubscriber>, StoreError> {
        let state = self.state();
        state.check()?;
        Ok(state.subscribers.values().cloned().collect())
    }

    async fn claim_digest_day(&self, recipient: &str, day: NaiveDate) -> Result<bool, StoreError> {
        let mut state = self.state();
        state.check()?;
        match state.subscribers.get_mut(recipient) {
            Some(sub) if sub.last_digest_sent_date.map(|last| last < day).unwrap_or(true) => {
                sub.last_digest_sent_date = Some(day);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
