//! Admission control: the façade request pipelines call.

mod controller;
mod decision;
mod janitor;

pub use controller::{AdmissionBackend, AdmissionController, EngineStats, MaintenanceReport};
pub use decision::{
    Decision, RateLimitHeaders, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use janitor::spawn_janitor;
