pub mod reaper;
pub mod scheduler;

pub use reaper::Reaper;
pub use scheduler::ClaimScheduler;

use remind_core::StoreError;

/// A database outage is expected to clear on its own; anything else is a bug
/// or a schema problem worth an `error!`.
pub(crate) fn log_loop_error(what: &str, e: &anyhow::Error) {
    if is_outage(e) {
        tracing::warn!("{} skipped, store unavailable: {}", what, e);
    } else {
        tracing::error!("{} failed: {}", what, e);
    }
}

pub(crate) fn is_outage(e: &anyhow::Error) -> bool {
    e.downcast_ref::<StoreError>()
        .map(StoreError::is_unavailable)
        .unwrap_or(false)
}
