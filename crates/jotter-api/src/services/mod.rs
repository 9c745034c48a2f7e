//! Service layer for jotter-api.
//!
//! Services sit between the HTTP handlers and the storage/queue backends.

pub mod lifecycle;
pub mod rate_limiter;

pub use lifecycle::{Admission, RequestLifecycle, Submission};
pub use rate_limiter::{RateLimitConfig, RateLimitRule, RateLimiter};
