//! What the shared store holds, and under which keys.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use regex::Regex;

use crate::http::{Headers, Response, StatusCode};
use crate::security::rate_limit::Bucket;

/// A captured response: status, headers as they stood at the last body write,
/// and the full body. Immutable once built; replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rebuilds a response from the captured parts.
    ///
    /// Every stored header is replayed except `Content-Type`, which is then set
    /// once from the stored value so a replay never carries two.
    pub fn replay(&self) -> Response {
        let mut response = Response::new(self.status);
        for (name, value) in self.headers.iter() {
            if !name.eq_ignore_ascii_case("content-type") {
                response.add_header(name, value);
            }
        }
        if let Some(content_type) = self.headers.get("content-type") {
            response.set_header("Content-Type", content_type);
        }
        response.write_body(&self.body);
        response
    }
}

/// A value held in the shared store.
///
/// One store backs the response cache, the rate limiter and the pattern
/// cache; the variant says which of them owns a slot, so a value is never
/// read as the wrong kind.
#[derive(Clone)]
pub enum StoredValue {
    Response(Arc<CacheEntry>),
    Bucket(Arc<Bucket>),
    Pattern(Regex),
}

impl StoredValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StoredValue::Response(_) => "response",
            StoredValue::Bucket(_) => "bucket",
            StoredValue::Pattern(_) => "pattern",
        }
    }
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredValue::Response(entry) => f.debug_tuple("Response").field(entry).finish(),
            StoredValue::Bucket(_) => f.write_str("Bucket(..)"),
            StoredValue::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
        }
    }
}

/// Key space of the shared store.
///
/// Every store key is built through [`Namespace::key`], so keys of different
/// namespaces can never collide, whatever raw text the caller feeds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Response,
    Bucket,
    Pattern,
}

impl Namespace {
    pub const fn prefix(self) -> &'static str {
        match self {
            Namespace::Response => "cache:",
            Namespace::Bucket => "ratelimit:",
            Namespace::Pattern => "regexp:",
        }
    }

    pub fn key(self, raw: &str) -> String {
        let prefix = self.prefix();
        let mut key = String::with_capacity(prefix.len() + raw.len());
        key.push_str(prefix);
        key.push_str(raw);
        key
    }

    pub fn owns(self, key: &str) -> bool {
        key.starts_with(self.prefix())
    }
}
