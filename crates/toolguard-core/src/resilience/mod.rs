//! Rate limiting and circuit breaking, keyed per (agent, tool).

pub mod circuit_breaker;
pub mod rate_limit;
pub mod store;

pub use circuit_breaker::{
    Admission, CallOutcome, CircuitBreaker, CircuitRejection, CircuitState, InMemoryCircuitBreaker,
};
pub use rate_limit::{resolve_limit, validate_limit, InMemoryRateLimiter, RateDecision, RateLimiter};
pub use store::{CallKey, KeyedStore};
