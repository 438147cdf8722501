use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool as create_db_pool, DbPool};
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::redpanda::{create_consumer, create_producer, RedpandaConsumer, RedpandaProducer};
use crate::repos::PgStore;

/// Shared handles for every long-running task in the process.
#[derive(Clone)]
pub struct RemindContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub redis_pool: RedisPool,
    pub redpanda_producer: RedpandaProducer,
}

impl RemindContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        let redis_pool = create_redis_pool(&config.redis).await?;
        let redpanda_producer = create_producer(&config.redpanda)?;

        Ok(RemindContext {
            config: Arc::new(config),
            db_pool,
            redis_pool,
            redpanda_producer,
        })
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.db_pool.clone())
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<RedpandaConsumer> {
        create_consumer(&self.config.redpanda, group_id)
    }
}
