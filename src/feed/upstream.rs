//! HTTP-backed [`FeedTransformer`].

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use tracing::debug;

use super::{Feed, FeedError, FeedRequest, FeedTransformer, filter};

/// Fetches feeds over HTTP and filters them with [`filter::apply`].
#[derive(Debug, Clone)]
pub struct UpstreamTransformer {
    client: Client,
}

impl UpstreamTransformer {
    /// Every fetch is bounded by `fetch_timeout`, connect to last body byte.
    pub fn new(fetch_timeout: Duration) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| FeedError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }

    async fn fetch(&self, request: &FeedRequest) -> Result<String, FeedError> {
        let mut builder = self.client.get(request.feed_url.clone());
        if let Some(agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, agent);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Upstream {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_owned(),
            });
        }
        response.text().await.map_err(map_reqwest_error)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FeedError {
    if e.is_timeout() {
        FeedError::Timeout
    } else {
        FeedError::Fetch(e.to_string())
    }
}

impl FeedTransformer for UpstreamTransformer {
    fn transform(&self, request: FeedRequest) -> BoxFuture<'_, Result<Feed, FeedError>> {
        Box::pin(async move {
            let body = self.fetch(&request).await?;
            let feed = filter::apply(&body, &request.rules)?;
            debug!(
                feed_url = %request.feed_url,
                kind = ?feed.kind,
                bytes_in = body.len(),
                bytes_out = feed.body.len(),
                "feed filtered"
            );
            Ok(feed)
        })
    }
}
