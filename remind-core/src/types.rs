use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One concrete delivery, either standalone or expanded from a recurring definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub recipient: String,
    pub payload_text: String,
    pub due_at: DateTime<Utc>,
    pub sent: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub source_recurrence_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub recipient: String,
    pub payload_text: String,
    pub due_at: DateTime<Utc>,
    pub source_recurrence_id: Option<i64>,
}

impl NewNotification {
    pub fn one_time(recipient: impl Into<String>, payload_text: impl Into<String>, due_at: DateTime<Utc>) -> Self {
        Self {
            recipient: recipient.into(),
            payload_text: payload_text.into(),
            due_at,
            source_recurrence_id: None,
        }
    }
}

/// Stored shape of a recurrence rule: a type tag plus an optional day
/// (weekday 0=Mon..6=Sun for `weekly`, day of month for `monthly`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringDefinition {
    pub id: i64,
    pub recipient: String,
    pub payload_text: String,
    pub recurrence_type: String,
    pub recurrence_day: Option<i32>,
    pub local_time: NaiveTime,
    pub timezone: String,
    pub active: bool,
    pub last_generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecurringDefinition {
    pub recipient: String,
    pub payload_text: String,
    pub recurrence_type: String,
    pub recurrence_day: Option<i32>,
    pub local_time: NaiveTime,
    pub timezone: String,
}

/// A user with the daily digest switched on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSubscriber {
    pub recipient: String,
    pub first_name: Option<String>,
    pub timezone: String,
    pub digest_time: NaiveTime,
    pub last_digest_sent_date: Option<NaiveDate>,
}

/// Message handed from the claim scheduler to a delivery worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub notification_id: i64,
    pub recipient: String,
    pub payload_text: String,
}

impl From<&Notification> for DeliveryJob {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            recipient: n.recipient.clone(),
            payload_text: n.payload_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Last four digits only; full numbers never reach the logs.
pub fn mask_recipient(recipient: &str) -> String {
    let digits: Vec<char> = recipient.chars().collect();
    if digits.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("...{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_all_but_last_four() {
        assert_eq!(mask_recipient("+15551234567"), "...4567");
        assert_eq!(mask_recipient("123"), "****");
    }
}
