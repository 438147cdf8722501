use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use remind_core::config::SchedulingConfig;
use remind_core::types::RecurringDefinition;
use remind_core::{RecurringRepo, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing;

use crate::rule::{localize, occurrences_between, RecurrenceRule};

/// Longest search for a first occurrence. Every rule fires at least once a year.
const FIRST_OCCURRENCE_SEARCH_DAYS: usize = 366;

#[derive(Debug, Error)]
pub enum RecurrenceError {
    #[error("unknown timezone '{0}'")]
    Timezone(String),

    #[error("invalid recurrence rule: {0}")]
    Rule(String),

    #[error("recurring definition {0} not found")]
    NotFound(i64),

    #[error("recurring definition {0} is inactive")]
    Inactive(i64),

    #[error("no occurrence of recurring definition {0} within a year")]
    NoOccurrence(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Materializes recurring definitions into notification rows ahead of time.
pub struct Expander {
    store: Arc<dyn RecurringRepo>,
    interval: Duration,
    lookahead: ChronoDuration,
}

fn rule_and_zone(definition: &RecurringDefinition) -> Result<(RecurrenceRule, Tz), RecurrenceError> {
    let rule = RecurrenceRule::parse(&definition.recurrence_type, definition.recurrence_day)
        .map_err(RecurrenceError::Rule)?;
    let tz: Tz = definition
        .timezone
        .parse()
        .map_err(|_| RecurrenceError::Timezone(definition.timezone.clone()))?;
    Ok((rule, tz))
}

impl Expander {
    pub fn new(store: Arc<dyn RecurringRepo>, scheduling: &SchedulingConfig) -> Self {
        Self {
            store,
            interval: scheduling.expansion_interval,
            lookahead: ChronoDuration::from_std(scheduling.lookahead)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Starting recurrence expander (every {:?}, lookahead {}h)",
            self.interval,
            self.lookahead.num_hours()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.expand_all(Utc::now()).await {
                tracing::error!("Recurrence expansion failed: {}", e);
            }
        }
    }

    /// Expands every active definition. One bad definition is logged and
    /// skipped; it does not stop the others.
    pub async fn expand_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let definitions = self.store.list_active().await?;
        if definitions.is_empty() {
            tracing::debug!("No active recurring definitions");
            return Ok(0);
        }

        let mut generated = 0;
        for definition in &definitions {
            match self.expand_definition(definition, now).await {
                Ok(count) => generated += count,
                Err(RecurrenceError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::error!("Skipping recurring definition {}: {}", definition.id, e);
                }
            }
        }

        tracing::info!(
            "Generated {} notifications from {} recurring definitions",
            generated,
            definitions.len()
        );
        Ok(generated)
    }

    /// Inserts every occurrence in `(now, now + lookahead]` that does not exist
    /// yet. Returns how many rows were created.
    pub async fn expand_definition(
        &self,
        definition: &RecurringDefinition,
        now: DateTime<Utc>,
    ) -> Result<usize, RecurrenceError> {
        if !definition.active {
            return Ok(0);
        }
        let (rule, tz) = rule_and_zone(definition)?;

        let mut created = 0;
        for due_at in occurrences_between(rule, definition.local_time, tz, now, now + self.lookahead) {
            match self.store.insert_occurrence(definition, due_at).await? {
                Some(notification) => {
                    tracing::info!(
                        "Generated notification {} for recurring {} at {}",
                        notification.id,
                        definition.id,
                        due_at
                    );
                    self.store.mark_generated(definition.id, due_at).await?;
                    created += 1;
                }
                None => {
                    tracing::debug!("Occurrence of recurring {} at {} already exists", definition.id, due_at);
                }
            }
        }
        Ok(created)
    }

    /// Creates the next occurrence of a freshly created definition right away
    /// instead of waiting for the next expansion tick.
    pub async fn first_occurrence(&self, id: i64, now: DateTime<Utc>) -> Result<DateTime<Utc>, RecurrenceError> {
        let definition = self
            .store
            .get_recurring(id)
            .await?
            .ok_or(RecurrenceError::NotFound(id))?;
        if !definition.active {
            return Err(RecurrenceError::Inactive(id));
        }
        let (rule, tz) = rule_and_zone(&definition)?;

        let due_at = now
            .with_timezone(&tz)
            .date_naive()
            .iter_days()
            .take(FIRST_OCCURRENCE_SEARCH_DAYS + 1)
            .filter(|date| rule.matches(*date))
            .filter_map(|date| localize(date, definition.local_time, tz))
            .find(|due| *due > now)
            .ok_or(RecurrenceError::NoOccurrence(id))?;

        match self.store.insert_occurrence(&definition, due_at).await? {
            Some(notification) => tracing::info!(
                "Generated first occurrence {} for recurring {} at {}",
                notification.id,
                id,
                due_at
            ),
            None => tracing::info!("First occurrence of recurring {} at {} already exists", id, due_at),
        }
        self.store.mark_generated(id, due_at).await?;
        Ok(due_at)
    }
}
