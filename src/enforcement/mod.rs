//! Violation recording and explicit key blocking.

mod blocklist;
mod violations;

pub use blocklist::{BlockListManager, BlockedKey};
pub use violations::{
    RateLimitViolation, TopViolator, ViolationFilter, ViolationPage, ViolationRecorder,
    DEFAULT_VIOLATION_CAPACITY,
};
