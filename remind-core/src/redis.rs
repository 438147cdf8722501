use anyhow::{anyhow, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing;

use crate::config::RedisConfig;

/// Auto-reconnecting multiplexed handle; cheap to clone into every task.
pub type RedisPool = ConnectionManager;

pub async fn create_pool(config: &RedisConfig) -> Result<RedisPool> {
    tracing::info!("Connecting to Redis at {}", mask_redis_url(&config.url));

    let client = Client::open(config.url.as_str())
        .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

    let mut manager = ConnectionManager::new(client)
        .await
        .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

    let _: String = redis::cmd("PING")
        .query_async(&mut manager)
        .await
        .map_err(|e| anyhow!("Failed to ping Redis: {}", e))?;

    tracing::info!("Redis connection established");

    Ok(manager)
}

fn mask_redis_url(url: &str) -> String {
    match url.find('@') {
        Some(at_pos) => format!("redis://****{}", &url[at_pos..]),
        None => url.to_string(),
    }
}
