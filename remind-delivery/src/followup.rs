use anyhow::{anyhow, Result};
use async_trait::async_trait;
use remind_core::RedisPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Remembers the last reminder sent to each recipient for a short window, so
/// a reply like "SNOOZE" can be tied back to it.
#[async_trait]
pub trait FollowupLog: Send + Sync {
    async fn record(&self, recipient: &str, notification_id: i64) -> Result<()>;

    async fn last_sent(&self, recipient: &str) -> Result<Option<i64>>;
}

fn key(recipient: &str) -> String {
    format!("LAST_SENT:{}", recipient)
}

pub struct RedisFollowupLog {
    conn: RedisPool,
    window: Duration,
}

impl RedisFollowupLog {
    pub fn new(conn: RedisPool, window: Duration) -> Self {
        Self { conn, window }
    }
}

#[async_trait]
impl FollowupLog for RedisFollowupLog {
    async fn record(&self, recipient: &str, notification_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key(recipient))
            .arg(notification_id)
            .arg("EX")
            .arg(self.window.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to record last sent reminder: {}", e))?;
        Ok(())
    }

    async fn last_sent(&self, recipient: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let id: Option<i64> = redis::cmd("GET")
            .arg(key(recipient))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to read last sent reminder: {}", e))?;
        Ok(id)
    }
}

/// Process-local log without expiry, for local dispatch and tests.
#[derive(Default)]
pub struct MemoryFollowupLog {
    entries: Mutex<HashMap<String, i64>>,
}

impl MemoryFollowupLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FollowupLog for MemoryFollowupLog {
    async fn record(&self, recipient: &str, notification_id: i64) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("follow-up log poisoned"))?;
        entries.insert(key(recipient), notification_id);
        Ok(())
    }

    async fn last_sent(&self, recipient: &str) -> Result<Option<i64>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("follow-up log poisoned"))?;
        Ok(entries.get(&key(recipient)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_latest_per_recipient() {
        let log = MemoryFollowupLog::new();
        log.record("+15550001111", 3).await.unwrap();
        log.record("+15550001111", 7).await.unwrap();

        assert_eq!(log.last_sent("+15550001111").await.unwrap(), Some(7));
        assert_eq!(log.last_sent("+15550002222").await.unwrap(), None);
    }
}
