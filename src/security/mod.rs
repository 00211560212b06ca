//! Protection of the service against abusive clients.

pub mod rate_limit;

pub use rate_limit::{Bucket, Decision, FailMode, RateLimitMiddleware, RateLimiter};
