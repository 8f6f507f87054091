//! Warden - In-Process Admission Control
//!
//! This crate decides whether an inbound request may proceed. Requests are
//! checked against prioritised rate limit rules (fixed window, sliding window,
//! token bucket and leaky bucket), each counted under a key derived from the
//! rule's scope. Longer-period quotas, explicit key blocking, a violation log
//! and daily analytics sit alongside the limiter, all behind the
//! [`AdmissionController`] façade.
//!
//! ```no_run
//! use warden::{AdmissionController, EngineConfig, NewRule, RequestContext, Scope, Strategy};
//!
//! let controller = AdmissionController::new(EngineConfig::default());
//! controller
//!     .create_rule(NewRule::new("per-user", Scope::User, Strategy::FixedWindow, 5, 60_000))
//!     .unwrap();
//!
//! let decision = controller.evaluate(&RequestContext::new("/api/orders").with_user("u1"));
//! for (name, value) in decision.headers.to_pairs() {
//!     println!("{}: {}", name, value);
//! }
//! ```

pub mod admission;
pub mod analytics;
pub mod clock;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod events;
pub mod quota;
pub mod ratelimit;

pub use admission::{spawn_janitor, AdmissionBackend, AdmissionController, Decision, RateLimitHeaders};
pub use config::{EngineConfig, NoMatchPolicy, WardenConfig};
pub use error::{Result, WardenError};
pub use events::{EventBus, WardenEvent};
pub use ratelimit::{NewRule, RequestContext, Scope, Strategy};
