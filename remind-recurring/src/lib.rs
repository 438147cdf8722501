pub mod expander;
pub mod rule;

pub use expander::{Expander, RecurrenceError};
pub use rule::RecurrenceRule;
