//! `GET /tg/:name`: a public channel's recent posts as an RSS feed.

use std::fmt::Write as _;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use super::filter::escape_xml;
use super::{CONTENT_TYPE_RSS, FeedError};
use crate::context::Context;
use crate::http::{Response, StatusCode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelPost {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub link: String,
    pub author: String,
    /// RFC 2822 timestamp, when the post carried one.
    pub published: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    pub title: String,
    pub description: String,
    pub link: String,
    pub posts: Vec<ChannelPost>,
}

impl Channel {
    pub fn to_rss(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        out.push_str("<rss version=\"2.0\"><channel>");
        let _ = write!(
            out,
            "<title>{}</title><link>{}</link><description>{}</description>",
            escape_xml(&self.title),
            escape_xml(&self.link),
            escape_xml(&self.description),
        );
        for post in &self.posts {
            let _ = write!(
                out,
                "<item><title>{}</title><link>{}</link><description>{}</description><author>{}</author><guid>{}</guid>",
                escape_xml(&post.title),
                escape_xml(&post.link),
                escape_xml(&post.body),
                escape_xml(&post.author),
                post.id,
            );
            if let Some(published) = &post.published {
                let _ = write!(out, "<pubDate>{}</pubDate>", escape_xml(published));
            }
            out.push_str("</item>");
        }
        out.push_str("</channel></rss>");
        out
    }
}

/// Source of channel posts.
pub trait ChannelScraper: Send + Sync {
    fn scrape<'a>(
        &'a self,
        name: &'a str,
        user_agent: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Channel, FeedError>>;
}

/// 5 to 32 characters: an ASCII letter, then ASCII letters, digits and
/// underscores.
pub fn is_valid_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    (5..=32).contains(&name.len())
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub struct ChannelHandler {
    scraper: Arc<dyn ChannelScraper>,
}

impl ChannelHandler {
    pub fn new(scraper: Arc<dyn ChannelScraper>) -> Self {
        Self { scraper }
    }

    pub async fn handle(&self, ctx: Context) -> Response {
        let name = ctx.params().get("name").unwrap_or_default();
        if !is_valid_channel_name(name) {
            return Response::new(StatusCode::BadRequest).body("invalid telegram channel name\n");
        }

        let user_agent = ctx.request().headers().get("user-agent");
        match self.scraper.scrape(name, user_agent).await {
            Ok(channel) => Response::new(StatusCode::Ok)
                .header("Content-Type", CONTENT_TYPE_RSS)
                .body(channel.to_rss()),
            Err(e) => {
                warn!(channel = name, error = %e, "channel scrape failed");
                let status = StatusCode::ServiceUnavailable;
                Response::new(status).body(format!(
                    "{} {}",
                    status.as_u16(),
                    capitalize_first(&e.to_string())
                ))
            }
        }
    }
}
