pub mod consumer;
pub mod followup;
pub mod message;
pub mod pool;
pub mod sms;
pub mod worker;

pub use followup::{FollowupLog, MemoryFollowupLog, RedisFollowupLog};
pub use sms::TwilioGateway;
pub use worker::{DeliveryError, DeliveryOutcome, DeliveryWorker};
