use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;
use std::time::Duration;

use super::{chrono_duration, DigestRepo, LockedSend, NotificationRepo, RecurringRepo, SendOnce};
use crate::db::{DbConnection, DbPool};
use crate::error::{GatewayError, StoreError};
use crate::schema::{delivery_dead_letters, notifications, recurring_definitions, users};
use crate::types::{
    DeliveryStatus, DigestSubscriber, NewNotification, NewRecurringDefinition, Notification,
    RecurringDefinition,
};

#[derive(Queryable, Selectable)]
#[diesel(table_name = notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct NotificationRow {
    id: i64,
    recipient: String,
    payload_text: String,
    due_at: DateTime<Utc>,
    sent: bool,
    claimed_at: Option<DateTime<Utc>>,
    source_recurrence_id: Option<i64>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            recipient: row.recipient,
            payload_text: row.payload_text,
            due_at: row.due_at,
            sent: row.sent,
            claimed_at: row.claimed_at,
            source_recurrence_id: row.source_recurrence_id,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = notifications)]
struct NewNotificationRow<'a> {
    recipient: &'a str,
    payload_text: &'a str,
    due_at: DateTime<Utc>,
    source_recurrence_id: Option<i64>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = recurring_definitions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct RecurringRow {
    id: i64,
    recipient: String,
    payload_text: String,
    recurrence_type: String,
    recurrence_day: Option<i32>,
    local_time: NaiveTime,
    timezone: String,
    active: bool,
    last_generated_at: Option<DateTime<Utc>>,
}

impl From<RecurringRow> for RecurringDefinition {
    fn from(row: RecurringRow) -> Self {
        RecurringDefinition {
            id: row.id,
            recipient: row.recipient,
            payload_text: row.payload_text,
            recurrence_type: row.recurrence_type,
            recurrence_day: row.recurrence_day,
            local_time: row.local_time,
            timezone: row.timezone,
            active: row.active,
            last_generated_at: row.last_generated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = recurring_definitions)]
struct NewRecurringRow<'a> {
    recipient: &'a str,
    payload_text: &'a str,
    recurrence_type: &'a str,
    recurrence_day: Option<i32>,
    local_time: NaiveTime,
    timezone: &'a str,
}

/// Error type threaded through the send transaction so a gateway refusal
/// rolls back just like a database error.
enum TxError {
    Db(diesel::result::Error),
    Gateway(GatewayError),
}

impl From<diesel::result::Error> for TxError {
    fn from(e: diesel::result::Error) -> Self {
        TxError::Db(e)
    }
}

fn db_err(e: diesel::result::Error) -> StoreError {
    match e {
        diesel::result::Error::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
            StoreError::Unavailable(info.message().to_string())
        }
        diesel::result::Error::BrokenTransactionManager => {
            StoreError::Unavailable("broken transaction manager".to_string())
        }
        other => StoreError::Query(other),
    }
}

/// Postgres-backed store. Row locks (`FOR UPDATE` / `SKIP LOCKED`) are the
/// only coordination between worker processes.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl NotificationRepo for PgStore {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(notifications::table)
            .values(NewNotificationRow {
                recipient: &new.recipient,
                payload_text: &new.payload_text,
                due_at: new.due_at,
                source_recurrence_id: new.source_recurrence_id,
            })
            .returning(NotificationRow::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        let mut conn = self.conn().await?;
        let row = notifications::table
            .find(id)
            .select(NotificationRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(notifications::table.find(id))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    async fn claim_due(&self, batch_size: i64, staleness: Duration) -> Result<Vec<Notification>, StoreError> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let cutoff = now - chrono_duration(staleness);

        let rows = conn
            .transaction::<Vec<NotificationRow>, diesel::result::Error, _>(|conn| {
                async move {
                    let ids: Vec<i64> = notifications::table
                        .filter(notifications::due_at.le(now))
                        .filter(notifications::sent.eq(false))
                        .filter(notifications::failed_at.is_null())
                        .filter(
                            notifications::claimed_at
                                .is_null()
                                .or(notifications::claimed_at.lt(cutoff)),
                        )
                        .order(notifications::due_at.asc())
                        .limit(batch_size)
                        .select(notifications::id)
                        .for_update()
                        .skip_locked()
                        .load(conn)
                        .await?;

                    if ids.is_empty() {
                        return Ok(Vec::new());
                    }

                    diesel::update(notifications::table.filter(notifications::id.eq_any(ids)))
                        .set(notifications::claimed_at.eq(Some(now)))
                        .returning(NotificationRow::as_returning())
                        .get_results(conn)
                        .await
                }
                .scope_boxed()
            })
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn send_and_commit<'a>(&self, id: i64, send: SendOnce<'a>) -> Result<LockedSend, StoreError> {
        let mut conn = self.conn().await?;
        let mut delivered = false;
        let delivered_flag = &mut delivered;

        let outcome = conn
            .transaction::<LockedSend, TxError, _>(|conn| {
                async move {
                    let row = notifications::table
                        .find(id)
                        .select(NotificationRow::as_select())
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;

                    let row = match row {
                        Some(row) => row,
                        None => return Ok(LockedSend::Missing),
                    };
                    if row.sent {
                        return Ok(LockedSend::AlreadySent);
                    }

                    send(row.into()).await.map_err(TxError::Gateway)?;
                    *delivered_flag = true;

                    diesel::update(notifications::table.find(id))
                        .set((
                            notifications::sent.eq(true),
                            notifications::sent_at.eq(Some(Utc::now())),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(LockedSend::Sent)
                }
                .scope_boxed()
            })
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(TxError::Gateway(e)) => Ok(LockedSend::GatewayFailed(e)),
            Err(TxError::Db(e)) if delivered => Ok(LockedSend::CommitFailed(db_err(e))),
            Err(TxError::Db(e)) => Err(db_err(e)),
        }
    }

    async fn commit_sent(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(notifications::table.find(id))
            .set((
                notifications::sent.eq(true),
                notifications::sent_at.eq(Some(Utc::now())),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    async fn release(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            notifications::table
                .find(id)
                .filter(notifications::sent.eq(false)),
        )
        .set(notifications::claimed_at.eq(None::<DateTime<Utc>>))
        .execute(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(updated > 0)
    }

    async fn release_stale(&self, timeout: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let cutoff = Utc::now() - chrono_duration(timeout);
        let released = diesel::update(
            notifications::table
                .filter(notifications::sent.eq(false))
                .filter(notifications::failed_at.is_null())
                .filter(notifications::claimed_at.lt(cutoff)),
        )
        .set(notifications::claimed_at.eq(None::<DateTime<Utc>>))
        .execute(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(released as u64)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(
            notifications::table
                .find(id)
                .filter(notifications::sent.eq(false)),
        )
        .set((
            notifications::failed_at.eq(Some(Utc::now())),
            notifications::delivery_status.eq(Some(DeliveryStatus::Failed.as_str())),
            notifications::error_message.eq(Some(error)),
        ))
        .execute(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_delivery(&self, id: i64, status: DeliveryStatus, error: Option<&str>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(notifications::table.find(id))
            .set((
                notifications::delivery_status.eq(Some(status.as_str())),
                notifications::error_message.eq(error),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_dead_letter(&self, id: i64, recipient: &str, error: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(delivery_dead_letters::table)
            .values((
                delivery_dead_letters::notification_id.eq(id),
                delivery_dead_letters::recipient.eq(recipient),
                delivery_dead_letters::error.eq(error),
            ))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn for_recipient_between(
        &self,
        recipient: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = notifications::table
            .filter(notifications::recipient.eq(recipient))
            .filter(notifications::due_at.ge(start))
            .filter(notifications::due_at.lt(end))
            .order(notifications::due_at.asc())
            .select(NotificationRow::as_select())
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl RecurringRepo for PgStore {
    async fn create_recurring(&self, new: &NewRecurringDefinition) -> Result<RecurringDefinition, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(recurring_definitions::table)
            .values(NewRecurringRow {
                recipient: &new.recipient,
                payload_text: &new.payload_text,
                recurrence_type: &new.recurrence_type,
                recurrence_day: new.recurrence_day,
                local_time: new.local_time,
                timezone: &new.timezone,
            })
            .returning(RecurringRow::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get_recurring(&self, id: i64) -> Result<Option<RecurringDefinition>, StoreError> {
        let mut conn = self.conn().await?;
        let row = recurring_definitions::table
            .find(id)
            .select(RecurringRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_active(&self) -> Result<Vec<RecurringDefinition>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = recurring_definitions::table
            .filter(recurring_definitions::active.eq(true))
            .order(recurring_definitions::id.asc())
            .select(RecurringRow::as_select())
            .load(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn deactivate(&self, id: i64) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(recurring_definitions::table.find(id))
            .set(recurring_definitions::active.eq(false))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    async fn insert_occurrence(
        &self,
        definition: &RecurringDefinition,
        due_at: DateTime<Utc>,
    ) -> Result<Option<Notification>, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(notifications::table)
            .values(NewNotificationRow {
                recipient: &definition.recipient,
                payload_text: &definition.payload_text,
                due_at,
                source_recurrence_id: Some(definition.id),
            })
            .on_conflict_do_nothing()
            .returning(NotificationRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn mark_generated(&self, id: i64, due_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::update(recurring_definitions::table.find(id))
            .set(recurring_definitions::last_generated_at.eq(Some(due_at)))
            .execute(&mut conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl DigestRepo for PgStore {
    async fn digest_subscribers(&self) -> Result<Vec<DigestSubscriber>, StoreError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, Option<String>, String, Option<NaiveTime>, Option<NaiveDate>)> =
            users::table
                .filter(users::daily_digest_enabled.eq(true))
                .filter(users::daily_digest_time.is_not_null())
                .select((
                    users::phone_number,
                    users::first_name,
                    users::timezone,
                    users::daily_digest_time,
                    users::last_digest_sent_date,
                ))
                .load(&mut conn)
                .await
                .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|(recipient, first_name, timezone, digest_time, last_sent)| {
                digest_time.map(|digest_time| DigestSubscriber {
                    recipient,
                    first_name,
                    timezone,
                    digest_time,
                    last_digest_sent_date: last_sent,
                })
            })
            .collect())
    }

    async fn claim_digest_day(&self, recipient: &str, day: NaiveDate) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            users::table
                .filter(users::phone_number.eq(recipient))
                .filter(
                    users::last_digest_sent_date
                        .is_null()
                        .or(users::last_digest_sent_date.lt(day)),
                ),
        )
        .set(users::last_digest_sent_date.eq(Some(day)))
        .execute(&mut conn)
        .await
        .map_err(db_err)?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{create_pool, run_migrations};
    use crate::repos::SendFuture;
    use assert_matches::assert_matches;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use diesel_async::AsyncPgConnection;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STALENESS: Duration = Duration::from_secs(300);

    static SCHEMA_SEQ: AtomicUsize = AtomicUsize::new(0);

    /// A freshly migrated schema on `DATABASE_URL`. Tests return early when
    /// the variable is unset.
    struct TestDb {
        store: PgStore,
        pool: Arc<DbPool>,
        admin_url: String,
        schema: String,
    }

    async fn setup() -> Option<TestDb> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set, skipping Postgres store test");
            return None;
        };
        let schema = format!(
            "remind_test_{}_{}",
            std::process::id(),
            SCHEMA_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        let mut admin = AsyncPgConnection::establish(&url).await.unwrap();
        diesel::sql_query(format!("CREATE SCHEMA {}", schema))
            .execute(&mut admin)
            .await
            .unwrap();

        let separator = if url.contains('?') { '&' } else { '?' };
        let config = DatabaseConfig {
            url: format!("{}{}options=-c%20search_path%3D{}", url, separator, schema),
            max_connections: 8,
        };
        run_migrations(&config).await.unwrap();
        let pool = create_pool(&config).await.unwrap();

        Some(TestDb {
            store: PgStore::new(pool.clone()),
            pool,
            admin_url: url,
            schema,
        })
    }

    impl TestDb {
        async fn seed(&self, recipient: &str, offset: ChronoDuration) -> Notification {
            self.store
                .insert(&NewNotification::one_time(recipient, "refill prescription", Utc::now() + offset))
                .await
                .unwrap()
        }

        async fn teardown(self) {
            drop(self.store);
            drop(self.pool);
            let mut admin = AsyncPgConnection::establish(&self.admin_url).await.unwrap();
            diesel::sql_query(format!("DROP SCHEMA {} CASCADE", self.schema))
                .execute(&mut admin)
                .await
                .unwrap();
        }
    }

    fn ids(rows: &[Notification]) -> Vec<i64> {
        rows.iter().map(|n| n.id).collect()
    }

    fn counting_send(calls: Arc<AtomicUsize>, result: Result<(), GatewayError>) -> SendOnce<'static> {
        Box::new(move |_n: Notification| -> SendFuture<'static> {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                result
            })
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_get_disjoint_batches_covering_the_due_set() {
        let Some(db) = setup().await else { return };
        let mut due = HashSet::new();
        for i in 0..30 {
            let n = db
                .seed(&format!("+1555010{:04}", i), ChronoDuration::seconds(-(i + 1)))
                .await;
            due.insert(n.id);
        }
        db.seed("+15550109999", ChronoDuration::hours(1)).await;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = db.store.clone();
                tokio::spawn(async move {
                    let mut mine = Vec::new();
                    loop {
                        let batch = store.claim_due(5, STALENESS).await.unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        assert!(batch.len() <= 5);
                        mine.extend(ids(&batch));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "notification {} claimed twice", id);
            }
        }
        assert_eq!(seen, due);

        db.teardown().await;
    }

    #[tokio::test]
    async fn row_locked_by_open_transaction_is_skipped() {
        let Some(db) = setup().await else { return };
        let locked = db.seed("+15550200001", ChronoDuration::minutes(-2)).await;
        let free = db.seed("+15550200002", ChronoDuration::minutes(-1)).await;

        let mut conn = db.pool.get().await.unwrap();
        let store = db.store.clone();
        let locked_id = locked.id;
        let claimed = conn
            .transaction::<Vec<Notification>, diesel::result::Error, _>(move |conn| {
                async move {
                    let _: i64 = notifications::table
                        .find(locked_id)
                        .select(notifications::id)
                        .for_update()
                        .first(conn)
                        .await?;
                    Ok(store.claim_due(10, STALENESS).await.unwrap())
                }
                .scope_boxed()
            })
            .await
            .unwrap();
        assert_eq!(ids(&claimed), vec![free.id]);
        drop(conn);

        let next = db.store.claim_due(10, STALENESS).await.unwrap();
        assert_eq!(ids(&next), vec![locked.id]);

        db.teardown().await;
    }

    #[tokio::test]
    async fn send_and_commit_marks_sent_and_skips_the_resend() {
        let Some(db) = setup().await else { return };
        let n = db.seed("+15550300001", ChronoDuration::minutes(-1)).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let first = db
            .store
            .send_and_commit(n.id, counting_send(calls.clone(), Ok(())))
            .await
            .unwrap();
        assert_matches!(first, LockedSend::Sent);
        let second = db
            .store
            .send_and_commit(n.id, counting_send(calls.clone(), Ok(())))
            .await
            .unwrap();
        assert_matches!(second, LockedSend::AlreadySent);

        assert_eq!(AtomicUsize::load(&calls, Ordering::SeqCst), 1);
        assert!(db.store.get(n.id).await.unwrap().unwrap().sent);

        db.teardown().await;
    }

    #[tokio::test]
    async fn gateway_failure_rolls_back_and_unlocks() {
        let Some(db) = setup().await else { return };
        let n = db.seed("+15550300002", ChronoDuration::minutes(-1)).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = db
            .store
            .send_and_commit(
                n.id,
                counting_send(calls.clone(), Err(GatewayError::Transient("503".to_string()))),
            )
            .await
            .unwrap();
        assert_matches!(outcome, LockedSend::GatewayFailed(GatewayError::Transient(_)));
        assert!(!db.store.get(n.id).await.unwrap().unwrap().sent);

        let claimed = db.store.claim_due(10, STALENESS).await.unwrap();
        assert_eq!(ids(&claimed), vec![n.id]);

        db.teardown().await;
    }

    #[tokio::test]
    async fn deleted_row_is_missing() {
        let Some(db) = setup().await else { return };
        let n = db.seed("+15550300003", ChronoDuration::minutes(-1)).await;
        assert!(db.store.delete(n.id).await.unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let outcome = db
            .store
            .send_and_commit(n.id, counting_send(calls.clone(), Ok(())))
            .await
            .unwrap();
        assert_matches!(outcome, LockedSend::Missing);
        assert_eq!(AtomicUsize::load(&calls, Ordering::SeqCst), 0);

        db.teardown().await;
    }

    #[tokio::test]
    async fn stale_claims_are_released_fresh_ones_kept() {
        let Some(db) = setup().await else { return };
        let old = db.seed("+15550400001", ChronoDuration::minutes(-30)).await;
        let fresh = db.seed("+15550400002", ChronoDuration::minutes(-30)).await;

        let mut conn = db.pool.get().await.unwrap();
        diesel::update(notifications::table.find(old.id))
            .set(notifications::claimed_at.eq(Some(Utc::now() - ChronoDuration::minutes(20))))
            .execute(&mut conn)
            .await
            .unwrap();
        diesel::update(notifications::table.find(fresh.id))
            .set(notifications::claimed_at.eq(Some(Utc::now())))
            .execute(&mut conn)
            .await
            .unwrap();
        drop(conn);

        assert_eq!(db.store.release_stale(Duration::from_secs(600)).await.unwrap(), 1);
        assert_eq!(db.store.get(old.id).await.unwrap().unwrap().claimed_at, None);
        assert!(db.store.get(fresh.id).await.unwrap().unwrap().claimed_at.is_some());

        db.teardown().await;
    }

    #[tokio::test]
    async fn duplicate_occurrence_insert_returns_none() {
        let Some(db) = setup().await else { return };
        let def = db
            .store
            .create_recurring(&NewRecurringDefinition {
                recipient: "+15550500001".to_string(),
                payload_text: "stretch".to_string(),
                recurrence_type: "daily".to_string(),
                recurrence_day: None,
                local_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                timezone: "UTC".to_string(),
            })
            .await
            .unwrap();
        let due = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();

        let first = db.store.insert_occurrence(&def, due).await.unwrap();
        assert_matches!(first, Some(ref n) if n.source_recurrence_id == Some(def.id));
        let second = db.store.insert_occurrence(&def, due).await.unwrap();
        assert_eq!(second, None);

        let rows = db
            .store
            .for_recipient_between("+15550500001", due - ChronoDuration::hours(1), due + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        db.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn digest_day_is_claimed_once_and_only_forward() {
        let Some(db) = setup().await else { return };
        let mut conn = db.pool.get().await.unwrap();
        diesel::insert_into(users::table)
            .values((
                users::phone_number.eq("+15550600001"),
                users::first_name.eq(Some("Ada")),
                users::timezone.eq("UTC"),
                users::daily_digest_enabled.eq(true),
                users::daily_digest_time.eq(Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap())),
            ))
            .execute(&mut conn)
            .await
            .unwrap();
        drop(conn);

        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = db.store.clone();
                tokio::spawn(async move { store.claim_digest_day("+15550600001", today).await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        assert!(!db.store.claim_digest_day("+15550600001", today).await.unwrap());
        assert!(!db.store.claim_digest_day("+15550600001", yesterday).await.unwrap());

        let subscribers = db.store.digest_subscribers().await.unwrap();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].last_digest_sent_date, Some(today));

        db.teardown().await;
    }
}
