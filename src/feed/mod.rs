//! Feed endpoints and the collaborators behind them.
//!
//! - [`mute`]: the `/mute` endpoint, its query validation, and the
//!   [`FeedTransformer`] it drives.
//! - [`filter`]: feed type detection and item filtering for RSS, Atom and
//!   JSON Feed documents.
//! - [`patterns`]: compiled filter patterns kept in the shared store.
//! - [`upstream`]: the HTTP-backed [`FeedTransformer`].
//! - [`channel`]: the `/tg/:name` endpoint and the [`ChannelScraper`] it
//!   drives.

use futures::future::BoxFuture;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::http::{Response, StatusCode};

pub mod channel;
pub mod filter;
pub mod mute;
pub mod patterns;
pub mod upstream;

pub use channel::{Channel, ChannelHandler, ChannelPost, ChannelScraper};
pub use mute::{MuteHandler, MuteQuery};
pub use patterns::PatternCache;
pub use upstream::UpstreamTransformer;

pub const CONTENT_TYPE_RSS: &str = "application/rss+xml";
pub const CONTENT_TYPE_ATOM: &str = "application/atom+xml";
pub const CONTENT_TYPE_JSON: &str = "application/feed+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Rss,
    Atom,
    Json,
}

impl FeedKind {
    pub fn content_type(self) -> &'static str {
        match self {
            FeedKind::Rss => CONTENT_TYPE_RSS,
            FeedKind::Atom => CONTENT_TYPE_ATOM,
            FeedKind::Json => CONTENT_TYPE_JSON,
        }
    }
}

/// Which items to mute, and what to do with them.
///
/// An item matches when its title matches `title` or its description
/// matches `description`. Matching items are dropped, or kept with their
/// author replaced when `rewrite_author` is set.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    pub title: Option<Regex>,
    pub description: Option<Regex>,
    pub rewrite_author: Option<String>,
}

impl FilterRules {
    pub fn matches(&self, title: Option<&str>, description: Option<&str>) -> bool {
        let hit = |re: &Option<Regex>, text: Option<&str>| {
            re.as_ref().is_some_and(|re| re.is_match(text.unwrap_or_default()))
        };
        hit(&self.title, title) || hit(&self.description, description)
    }
}

#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub feed_url: Url,
    pub rules: FilterRules,
    /// Forwarded to the upstream as its `User-Agent`.
    pub user_agent: Option<String>,
}

/// A rendered feed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub kind: FeedKind,
    pub body: String,
}

impl Feed {
    pub fn into_response(self) -> Response {
        Response::new(StatusCode::Ok)
            .header("Content-Type", self.kind.content_type())
            .body(self.body)
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request cancelled")]
    Cancelled,

    #[error("timed out fetching feed")]
    Timeout,

    #[error("upstream answered {status} {reason}")]
    Upstream { status: u16, reason: String },

    #[error("failed to detect feed type")]
    UndetectedFeedType,

    #[error("unable to build feed: {0}")]
    Render(String),

    #[error("fetch failed: {0}")]
    Fetch(String),
}

impl FeedError {
    /// Status reported to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            FeedError::Timeout => StatusCode::GatewayTimeout,
            FeedError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::ServiceUnavailable)
            }
            FeedError::Cancelled
            | FeedError::UndetectedFeedType
            | FeedError::Render(_)
            | FeedError::Fetch(_) => StatusCode::ServiceUnavailable,
        }
    }

    pub fn to_response(&self) -> Response {
        let status = self.status();
        let line = match self {
            FeedError::Upstream {
                status: code,
                reason,
            } => format!("{code} {reason}"),
            FeedError::UndetectedFeedType => format!("{} Failed to detect feed type", status.as_u16()),
            FeedError::Render(_) => format!("{} Unable to build feed", status.as_u16()),
            FeedError::Fetch(_) => format!("{} Unexpected Error", status.as_u16()),
            FeedError::Cancelled | FeedError::Timeout => {
                format!("{} {}", status.as_u16(), status.canonical_reason())
            }
        };
        Response::new(status).body(line)
    }
}

/// Fetches a feed and applies [`FilterRules`] to it.
pub trait FeedTransformer: Send + Sync {
    fn transform(&self, request: FeedRequest) -> BoxFuture<'_, Result<Feed, FeedError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        assert_eq!(FeedError::Timeout.status(), StatusCode::GatewayTimeout);
        assert_eq!(FeedError::Cancelled.status(), StatusCode::ServiceUnavailable);
        assert_eq!(FeedError::UndetectedFeedType.status(), StatusCode::ServiceUnavailable);
        assert_eq!(FeedError::Fetch("dns".into()).status(), StatusCode::ServiceUnavailable);
        let upstream = FeedError::Upstream {
            status: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(upstream.status(), StatusCode::NotFound);
    }

    #[test]
    fn error_bodies() {
        let body = |e: FeedError| String::from_utf8(e.to_response().body_ref().to_vec()).unwrap();
        assert_eq!(body(FeedError::Timeout), "504 Gateway Timeout");
        assert_eq!(body(FeedError::UndetectedFeedType), "503 Failed to detect feed type");
        assert_eq!(body(FeedError::Fetch("reset".into())), "503 Unexpected Error");
        assert_eq!(
            body(FeedError::Upstream {
                status: 410,
                reason: "Gone".into()
            }),
            "410 Gone"
        );
    }

    #[test]
    fn unknown_upstream_status_is_unavailable() {
        let e = FeedError::Upstream {
            status: 418,
            reason: "I'm a teapot".into(),
        };
        assert_eq!(e.status(), StatusCode::ServiceUnavailable);
    }

    #[test]
    fn rules_match_either_field() {
        let rules = FilterRules {
            title: Some(Regex::new("(?i)sponsored").unwrap()),
            description: Some(Regex::new("giveaway").unwrap()),
            rewrite_author: None,
        };
        assert!(rules.matches(Some("SPONSORED: thing"), None));
        assert!(rules.matches(Some("news"), Some("a giveaway")));
        assert!(!rules.matches(Some("news"), Some("body")));
        assert!(!FilterRules::default().matches(Some("x"), Some("y")));
    }
}
