//! Per-client token buckets kept in the shared store.
//!
//! Each client IP gets a GCRA limiter (`burst` requests back to back, one more
//! every `interval`). The limiter lives in the store under the `ratelimit:`
//! namespace and every check touches it, so a bucket only disappears after a
//! client has been silent for `ttl`. When it does, the client simply starts
//! over with a full bucket.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::cache::{Namespace, SharedStore, StoredValue};
use crate::config::{ConfigError, RateLimitConfig};
use crate::context::Context;
use crate::http::{Response, StatusCode};
use crate::middleware::{BoxResponse, Middleware, Next};

/// What to do when a bucket slot holds something that is not a bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Allow the request and replace the slot with a fresh bucket.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// One client's token bucket.
pub struct Bucket {
    limiter: DefaultDirectRateLimiter,
}

impl Bucket {
    pub fn new(quota: Quota) -> Self {
        Self {
            limiter: GovernorRateLimiter::direct(quota),
        }
    }

    /// Takes one token if there is one. Atomic across concurrent callers.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    store: SharedStore,
    quota: Quota,
    ttl: Duration,
    fail_mode: FailMode,
}

impl RateLimiter {
    pub fn new(store: SharedStore, config: &RateLimitConfig) -> Result<Self, ConfigError> {
        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| ConfigError::Invalid("rate_limit.burst must be positive".to_owned()))?;
        let quota = Quota::with_period(config.interval)
            .ok_or_else(|| ConfigError::Invalid("rate_limit.interval must be positive".to_owned()))?
            .allow_burst(burst);
        Ok(Self {
            store,
            quota,
            ttl: config.ttl,
            fail_mode: config.fail_mode,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Consumes one token from `identity`'s bucket, creating the bucket on
    /// first sight.
    pub fn check(&self, identity: &str) -> Decision {
        let key = Namespace::Bucket.key(identity);
        let value = self.store.get_or_insert_with(&key, self.ttl, || self.fresh_bucket());

        let bucket = match value {
            StoredValue::Bucket(bucket) => bucket,
            other => match self.fail_mode {
                FailMode::Open => {
                    warn!(%key, kind = other.kind(), "bucket slot held a foreign value, replacing it");
                    let repaired = self.store.replace_if(
                        &key,
                        self.ttl,
                        |current| !matches!(current, StoredValue::Bucket(_)),
                        || self.fresh_bucket(),
                    );
                    match repaired {
                        StoredValue::Bucket(bucket) => bucket,
                        _ => return self.deny(),
                    }
                }
                FailMode::Closed => {
                    warn!(%key, kind = other.kind(), "bucket slot held a foreign value, denying");
                    return self.deny();
                }
            },
        };

        if bucket.try_acquire() {
            Decision::Allow
        } else {
            debug!(%key, "rate limit exceeded");
            self.deny()
        }
    }

    fn fresh_bucket(&self) -> StoredValue {
        StoredValue::Bucket(Arc::new(Bucket::new(self.quota)))
    }

    fn deny(&self) -> Decision {
        Decision::Deny {
            retry_after: self.ttl,
        }
    }
}

/// Throttles clients by peer IP before anything downstream runs.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let limiter = Arc::clone(&self.limiter);
        Box::pin(async move {
            let Some(peer) = ctx.request().peer_addr() else {
                error!(path = %ctx.request().path(), "request carries no peer address, cannot rate limit");
                return Response::new(StatusCode::InternalServerError)
                    .body("500 Internal Server Error\n");
            };

            match limiter.check(&peer.ip().to_string()) {
                Decision::Allow => next.run(ctx).await,
                Decision::Deny { retry_after } => Response::new(StatusCode::TooManyRequests)
                    .header("Retry-After", retry_after_secs(retry_after).to_string())
                    .body("429 Too Many Requests\n"),
            }
        })
    }
}

/// Whole seconds for `Retry-After`, rounded up so a sub-second window never
/// reads as `0`.
fn retry_after_secs(window: Duration) -> u64 {
    window.as_secs() + u64::from(window.subsec_nanos() > 0)
}
