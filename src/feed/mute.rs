//! `GET /mute`: fetch a feed and mute the items matching the given patterns.
//!
//! | Parameter           | Rule                                                  |
//! |---------------------|-------------------------------------------------------|
//! | `feed_url`          | required, absolute `http`/`https` URL                 |
//! | `title_query`       | required without `description_query`, valid pattern  |
//! | `description_query` | required without `title_query`, valid pattern         |
//! | `rewrite_author`    | ASCII only                                            |

use std::fmt;
use std::sync::Arc;

use tracing::warn;
use url::Url;

use super::{FeedRequest, FeedTransformer, FilterRules, PatternCache};
use crate::context::Context;
use crate::http::{Request, Response, StatusCode};

/// One failed rule: the parameter and the name of the rule it broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub tag: &'static str,
}

/// Every rule a query broke, in parameter order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    pub fn to_response(&self) -> Response {
        Response::new(StatusCode::BadRequest).body(format!("{self}\n"))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "400 Bad Request")?;
        for error in &self.0 {
            write!(
                f,
                "\n* URL query parameter validation for '{}' failed on the '{}' tag",
                error.field, error.tag
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// A validated `/mute` query.
#[derive(Debug, Clone)]
pub struct MuteQuery {
    pub feed_url: Url,
    pub rules: FilterRules,
}

impl MuteQuery {
    /// Validates the query of `request`, compiling patterns through
    /// `patterns`. Empty parameters count as absent.
    pub fn parse(request: &Request, patterns: &PatternCache) -> Result<Self, ValidationErrors> {
        let param = |name: &str| request.query_param(name).filter(|value| !value.is_empty());
        let mut errors = Vec::new();
        let mut fail = |field: &'static str, tag: &'static str| errors.push(FieldError { field, tag });

        let feed_url = match param("feed_url") {
            None => {
                fail("feed_url", "required");
                None
            }
            Some(raw) => match Url::parse(raw) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Some(url),
                _ => {
                    fail("feed_url", "url");
                    None
                }
            },
        };

        let title_query = param("title_query");
        let description_query = param("description_query");

        let mut compile = |field: &'static str, expr: Option<&str>, other: Option<&str>| match expr {
            None if other.is_none() => {
                fail(field, "required_without");
                None
            }
            None => None,
            Some(expr) => match patterns.compile(expr) {
                Ok(re) => Some(re),
                Err(_) => {
                    fail(field, "regexp");
                    None
                }
            },
        };
        let title = compile("title_query", title_query, description_query);
        let description = compile("description_query", description_query, title_query);

        let rewrite_author = param("rewrite_author");
        if rewrite_author.is_some_and(|author| !author.is_ascii()) {
            fail("rewrite_author", "ascii");
        }

        match feed_url {
            Some(feed_url) if errors.is_empty() => Ok(Self {
                feed_url,
                rules: FilterRules {
                    title,
                    description,
                    rewrite_author: rewrite_author.map(str::to_owned),
                },
            }),
            _ => Err(ValidationErrors(errors)),
        }
    }
}

/// Serves `/mute` through a [`FeedTransformer`].
pub struct MuteHandler {
    transformer: Arc<dyn FeedTransformer>,
    patterns: PatternCache,
}

impl MuteHandler {
    pub fn new(transformer: Arc<dyn FeedTransformer>, patterns: PatternCache) -> Self {
        Self {
            transformer,
            patterns,
        }
    }

    pub async fn handle(&self, ctx: Context) -> Response {
        let query = match MuteQuery::parse(ctx.request(), &self.patterns) {
            Ok(query) => query,
            Err(errors) => return errors.to_response(),
        };

        let request = FeedRequest {
            feed_url: query.feed_url,
            rules: query.rules,
            user_agent: ctx.request().headers().get("user-agent").map(str::to_owned),
        };
        let feed_url = request.feed_url.clone();

        match self.transformer.transform(request).await {
            Ok(feed) => feed.into_response(),
            Err(e) => {
                warn!(%feed_url, error = %e, "feed transformation failed");
                e.to_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::future::BoxFuture;

    use crate::cache::TtlStore;
    use crate::feed::{Feed, FeedError, FeedKind};

    fn patterns() -> PatternCache {
        PatternCache::new(Arc::new(TtlStore::new()), Duration::from_secs(60))
    }

    fn request(query: &str) -> Request {
        let raw = format!("GET /mute?{query} HTTP/1.1\r\nHost: x\r\nUser-Agent: reader/1.0\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn failures(query: &str) -> Vec<(&'static str, &'static str)> {
        MuteQuery::parse(&request(query), &patterns())
            .unwrap_err()
            .fields()
            .iter()
            .map(|e| (e.field, e.tag))
            .collect()
    }

    #[test]
    fn valid_query() {
        let query = MuteQuery::parse(
            &request("feed_url=https%3A%2F%2Fexample.com%2Frss&title_query=%5EAd%3A&rewrite_author=Bot"),
            &patterns(),
        )
        .unwrap();
        assert_eq!(query.feed_url.as_str(), "https://example.com/rss");
        assert!(query.rules.title.unwrap().is_match("Ad: x"));
        assert!(query.rules.description.is_none());
        assert_eq!(query.rules.rewrite_author.as_deref(), Some("Bot"));
    }

    #[test]
    fn everything_missing() {
        assert_eq!(
            failures(""),
            vec![
                ("feed_url", "required"),
                ("title_query", "required_without"),
                ("description_query", "required_without"),
            ]
        );
    }

    #[test]
    fn bad_url_pattern_and_author() {
        assert_eq!(
            failures("feed_url=ftp://x/y&description_query=(&rewrite_author=%C3%A9"),
            vec![
                ("feed_url", "url"),
                ("description_query", "regexp"),
                ("rewrite_author", "ascii"),
            ]
        );
    }

    #[test]
    fn error_body_lists_each_failure() {
        let errors = MuteQuery::parse(&request("title_query=x"), &patterns()).unwrap_err();
        let response = errors.to_response();
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert_eq!(
            response.body_ref(),
            b"400 Bad Request\n* URL query parameter validation for 'feed_url' failed on the 'required' tag\n"
        );
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<FeedRequest>>,
    }

    impl FeedTransformer for Recording {
        fn transform(&self, request: FeedRequest) -> BoxFuture<'_, Result<Feed, FeedError>> {
            Box::pin(async move {
                let fail = request.feed_url.path() == "/timeout";
                self.seen.lock().unwrap().push(request);
                if fail {
                    return Err(FeedError::Timeout);
                }
                Ok(Feed {
                    kind: FeedKind::Atom,
                    body: "<feed/>".to_owned(),
                })
            })
        }
    }

    #[tokio::test]
    async fn handler_forwards_and_renders() {
        let transformer = Arc::new(Recording::default());
        let handler = MuteHandler::new(transformer.clone(), patterns());

        let ok = handler
            .handle(Context::new(request("feed_url=http://a.test/feed&title_query=x")))
            .await;
        assert_eq!(ok.status(), StatusCode::Ok);
        assert_eq!(ok.headers().get("content-type"), Some("application/atom+xml"));
        assert_eq!(ok.body_ref(), b"<feed/>");

        let timeout = handler
            .handle(Context::new(request("feed_url=http://a.test/timeout&title_query=x")))
            .await;
        assert_eq!(timeout.status(), StatusCode::GatewayTimeout);

        let seen = transformer.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].user_agent.as_deref(), Some("reader/1.0"));
    }

    #[tokio::test]
    async fn invalid_query_never_reaches_transformer() {
        let transformer = Arc::new(Recording::default());
        let handler = MuteHandler::new(transformer.clone(), patterns());
        let response = handler.handle(Context::new(request("feed_url=nope"))).await;
        assert_eq!(response.status(), StatusCode::BadRequest);
        assert!(transformer.seen.lock().unwrap().is_empty());
    }
}
