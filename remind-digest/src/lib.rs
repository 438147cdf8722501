pub mod format;
pub mod scheduler;

pub use format::{format_digest, DigestItem};
pub use scheduler::DigestScheduler;
