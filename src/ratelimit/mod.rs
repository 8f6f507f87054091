//! Rate limiting rules, per-key state and the limiting strategies.

mod engine;
mod key;
mod pattern;
mod rule;
mod ruleset;
mod state;
mod store;

pub use engine::{LimiterEngine, Outcome};
pub use key::{KeyResolver, RequestContext, StateKey};
pub use pattern::{EndpointFilter, EndpointPattern};
pub use rule::{NewRule, RateLimitRule, RuleUpdate, Scope, Strategy, ThrottleAction, DEFAULT_PRIORITY};
pub use ruleset::RuleSet;
pub use state::{RateLimitState, StateStore, TokenBucketState};
pub use store::{CompiledRule, RuleStore};
