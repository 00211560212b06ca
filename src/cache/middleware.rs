//! Response caching middleware.
//!
//! Per request:
//!
//! 1. Derive the [`CacheKey`] from path and query.
//! 2. Peek the store (no touch). A live response is replayed with
//!    `X-Cache: HIT` and `X-Cache-TTL`, and the handler never runs.
//! 3. Otherwise coalesce: the first caller runs the rest of the chain on its
//!    own task while later callers with the same key wait for it.
//! 4. The computation stores its result when the request was a `GET` and the
//!    status is 2xx. The leader gets the response with `X-Cache: MISS`;
//!    followers get a plain replay.
//!
//! Only `GET` and `HEAD` take part. A `HEAD` can be answered from an entry a
//! `GET` stored, but never stores one itself.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use super::coalesce::{Coalescer, Role};
use super::entry::{CacheEntry, Namespace, StoredValue};
use super::recorder::ResponseRecorder;
use super::store::TtlStore;
use crate::context::Context;
use crate::http::{Method, Response, StatusCode};
use crate::middleware::{BoxResponse, Middleware, Next};

pub const X_CACHE: &str = "X-Cache";
pub const X_CACHE_TTL: &str = "X-Cache-TTL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheKeyError {
    #[error("cannot derive a cache key from an empty path")]
    EmptyPath,
}

/// Store key of a cacheable request: the `cache:` namespace followed by the
/// path and, when present, `?` and the raw query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(path: &str, query: Option<&str>) -> Result<Self, CacheKeyError> {
        if path.is_empty() {
            return Err(CacheKeyError::EmptyPath);
        }
        let raw = match query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_owned(),
        };
        Ok(Self(Namespace::Response.key(&raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coalescing group for `method`. Methods never share a computation, even
    /// when they share a stored entry.
    fn group(&self, method: &Method) -> String {
        format!("{method} {}", self.0)
    }
}

/// Renders whole seconds the way `X-Cache-TTL` carries them: `1h2m3s`,
/// `4m5s`, `6s`, `0s`.
pub fn format_ttl(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{hours}h{minutes}m");
    } else if minutes > 0 {
        let _ = write!(out, "{minutes}m");
    }
    let _ = write!(out, "{seconds}s");
    out
}

#[derive(Clone)]
struct Computed {
    entry: Arc<CacheEntry>,
    delivered: Arc<Response>,
}

#[derive(Clone)]
pub struct CacheMiddleware {
    store: Arc<TtlStore<StoredValue>>,
    coalescer: Arc<Coalescer<Computed>>,
    ttl: Duration,
}

impl CacheMiddleware {
    /// Caches 2xx `GET` responses in `store` for `ttl`. Idle coalescing
    /// groups are released after `forget_after` (zero disables that).
    pub fn new(store: Arc<TtlStore<StoredValue>>, ttl: Duration, forget_after: Duration) -> Self {
        Self {
            store,
            coalescer: Arc::new(Coalescer::new(forget_after)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live cached entry for `key` and its remaining lifetime. Never touches.
    pub fn lookup(&self, key: &CacheKey) -> Option<(Arc<CacheEntry>, Duration)> {
        let item = self.store.peek(key.as_str())?;
        let remaining = item.remaining();
        match item.into_value() {
            StoredValue::Response(entry) => Some((entry, remaining)),
            other => {
                warn!(key = key.as_str(), kind = other.kind(), "foreign value under cache key, treating as miss");
                None
            }
        }
    }

    /// Drops the entry stored for `path_and_query` (e.g. `/mute?feed_url=..`).
    pub fn invalidate(&self, path_and_query: &str) -> bool {
        self.store.delete(&Namespace::Response.key(path_and_query))
    }

    /// Drops every cached response. Other namespaces in the store are kept.
    pub fn purge(&self) -> usize {
        let removed = self.store.delete_where(|key| Namespace::Response.owns(key));
        debug!(removed, "purged response cache");
        removed
    }

    async fn serve(self, ctx: Context, next: Next) -> Response {
        let method = ctx.request().method().clone();
        if !matches!(method, Method::Get | Method::Head) {
            return next.run(ctx).await;
        }

        let key = match CacheKey::new(ctx.request().path(), ctx.request().query_string()) {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "refusing to serve request without a cache key");
                return internal_error();
            }
        };

        if let Some((entry, remaining)) = self.lookup(&key) {
            debug!(key = key.as_str(), ?remaining, "cache hit");
            let mut response = entry.replay();
            response.set_header(X_CACHE, "HIT");
            response.set_header(X_CACHE_TTL, format_ttl(remaining));
            return response;
        }

        let store = Arc::clone(&self.store);
        let ttl = self.ttl;
        let store_key = key.as_str().to_owned();
        let cacheable_method = method == Method::Get;

        let computation = async move {
            let response = next.run(ctx).await;
            let mut recorder = ResponseRecorder::new();
            recorder.record(&response);
            let entry = Arc::new(recorder.snapshot());

            if cacheable_method && entry.status().is_success() {
                store.set(store_key.clone(), StoredValue::Response(Arc::clone(&entry)), ttl);
                debug!(key = %store_key, status = entry.status().as_u16(), "stored response");
            }

            Computed {
                entry,
                delivered: Arc::new(recorder.into_inner()),
            }
        };

        match self.coalescer.run(&key.group(&method), computation).await {
            (Role::Leader, Ok(computed)) => {
                let mut response = Arc::unwrap_or_clone(computed.delivered);
                response.set_header(X_CACHE, "MISS");
                response
            }
            (Role::Follower, Ok(computed)) => computed.entry.replay(),
            (role, Err(e)) => {
                error!(key = key.as_str(), ?role, error = %e, "coalesced request failed");
                internal_error()
            }
        }
    }
}

fn internal_error() -> Response {
    Response::new(StatusCode::InternalServerError).body("500 Internal Server Error\n")
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(self.clone().serve(ctx, next))
    }
}
