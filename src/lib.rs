//! # feedgate
//!
//! A feed-filtering HTTP proxy on a from-scratch async HTTP/1.1 stack, with a
//! coalescing response cache and per-client rate limiting sharing one TTL
//! store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use feedgate::feed::UpstreamTransformer;
//! use feedgate::{App, Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let transformer = Arc::new(UpstreamTransformer::new(config.feed.fetch_timeout)?);
//!     let app = App::new(&config, transformer, None)?;
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     app.serve(server, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod server;

pub mod app;
pub mod cache;
pub mod config;
pub mod context;
pub mod feed;
pub mod middleware;
pub mod router;
pub mod security;

pub use app::App;
pub use config::Config;
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
