pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod redis;
pub mod redpanda;
pub mod repos;
pub mod schema;
pub mod types;

pub use config::{Config, RetryPolicy, SchedulingConfig};
pub use context::RemindContext;
pub use db::DbPool;
pub use error::{ConfigError, GatewayError, QueueError, StoreError};
pub use gateway::SmsGateway;
pub use queue::{ChannelQueue, JobQueue, RedpandaQueue};
pub use redis::RedisPool;
pub use redpanda::{RedpandaConsumer, RedpandaProducer};
pub use repos::{DigestRepo, LockedSend, MemoryStore, NotificationRepo, PgStore, RecurringRepo};
pub use types::{mask_recipient, DeliveryJob, DeliveryStatus, Notification};
