//! Wiring: one shared store, one middleware chain, one sweeper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::{CacheMiddleware, SharedStore, TtlStore};
use crate::config::{Config, ConfigError};
use crate::context::Context;
use crate::feed::{ChannelHandler, ChannelScraper, FeedTransformer, MuteHandler, PatternCache};
use crate::middleware::{LoggerMiddleware, MiddlewareHandler, Next, from_middleware};
use crate::router::Router;
use crate::security::{RateLimitMiddleware, RateLimiter};
use crate::server::{Server, ServerError};
use crate::{Request, Response, StatusCode};

/// The assembled proxy.
///
/// Requests run through `Logger → RateLimit → Cache → Router`. The routes are
/// `GET /mute`, `HEAD /mute` and, when a scraper is supplied, `GET /tg/:name`.
///
/// `HEAD /mute` answers `204 No Content` on its own, but the cache sits in
/// front of the router and serves HEAD from a stored GET entry. Once a GET for
/// the same path and query is cached, the HEAD reply is that entry's status
/// and headers (`200`, `X-Cache: HIT`, the feed's `Content-Length`) until the
/// entry expires.
pub struct App {
    store: SharedStore,
    chain: Arc<[MiddlewareHandler]>,
    cache: CacheMiddleware,
    sweep_interval: Duration,
}

impl App {
    pub fn new(
        config: &Config,
        transformer: Arc<dyn FeedTransformer>,
        scraper: Option<Arc<dyn ChannelScraper>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let store: SharedStore = Arc::new(match config.cache.max_entries {
            Some(max) => TtlStore::bounded(max),
            None => TtlStore::new(),
        });

        let limiter = Arc::new(RateLimiter::new(Arc::clone(&store), &config.rate_limit)?);
        let cache = CacheMiddleware::new(
            Arc::clone(&store),
            config.cache.record_ttl,
            config.cache.forget_after,
        );
        let patterns = PatternCache::new(Arc::clone(&store), config.feed.pattern_ttl);

        let mut router = Router::new();
        let mute = Arc::new(MuteHandler::new(transformer, patterns));
        router.get("/mute", move |ctx: Context| {
            let mute = Arc::clone(&mute);
            async move { mute.handle(ctx).await }
        });
        router.head("/mute", |_ctx: Context| async { Response::new(StatusCode::NoContent) });
        if let Some(scraper) = scraper {
            let channel = Arc::new(ChannelHandler::new(scraper));
            router.get("/tg/:name", move |ctx: Context| {
                let channel = Arc::clone(&channel);
                async move { channel.handle(ctx).await }
            });
        }

        let chain: Arc<[MiddlewareHandler]> = Arc::from(vec![
            from_middleware(Arc::new(LoggerMiddleware)),
            from_middleware(Arc::new(RateLimitMiddleware::new(limiter))),
            from_middleware(Arc::new(cache.clone())),
            router.into_middleware(),
        ]);

        Ok(Self {
            store,
            chain,
            cache,
            sweep_interval: config.cache.sweep_interval,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn cache(&self) -> &CacheMiddleware {
        &self.cache
    }

    /// Runs one request through the chain.
    pub async fn handle(&self, request: Request) -> Response {
        Next::new(Arc::clone(&self.chain))
            .run(Context::new(request))
            .await
    }

    /// Serves until `shutdown` resolves. The store sweeper lives exactly as
    /// long as the accept loop.
    pub async fn serve<S>(self, server: Server, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        let sweeper = self.store.spawn_sweeper(self.sweep_interval);
        info!(interval = ?self.sweep_interval, "store sweeper started");

        let app = Arc::new(self);
        let result = server
            .run_until(
                move |request: Request| {
                    let app = Arc::clone(&app);
                    async move { app.handle(request).await }
                },
                shutdown,
            )
            .await;

        sweeper.stop();
        info!("store sweeper stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::BoxFuture;

    use crate::cache::CacheKey;
    use crate::cache::middleware::{X_CACHE, X_CACHE_TTL};
    use crate::feed::{Channel, Feed, FeedError, FeedKind, FeedRequest};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl FeedTransformer for Counting {
        fn transform(&self, _request: FeedRequest) -> BoxFuture<'_, Result<Feed, FeedError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Feed {
                    kind: FeedKind::Rss,
                    body: format!("<rss><channel><title>{n}</title></channel></rss>"),
                })
            })
        }
    }

    struct Empty;

    impl ChannelScraper for Empty {
        fn scrape<'a>(
            &'a self,
            name: &'a str,
            _user_agent: Option<&'a str>,
        ) -> BoxFuture<'a, Result<Channel, FeedError>> {
            Box::pin(async move {
                Ok(Channel {
                    title: name.to_owned(),
                    ..Channel::default()
                })
            })
        }
    }

    fn request(method: &str, target: &str, peer: &str) -> Request {
        let raw = format!("{method} {target} HTTP/1.1\r\nHost: x\r\n\r\n");
        let (mut request, _) = Request::parse(raw.as_bytes()).unwrap();
        request.set_peer_addr(peer.parse::<SocketAddr>().unwrap());
        request
    }

    fn app(transformer: Arc<Counting>) -> App {
        App::new(&Config::default(), transformer, Some(Arc::new(Empty))).unwrap()
    }

    const MUTE: &str = "/mute?feed_url=http%3A%2F%2Fa.test%2Frss&title_query=ads";

    #[tokio::test]
    async fn second_request_is_a_store_hit() {
        let transformer = Arc::new(Counting::default());
        let app = app(Arc::clone(&transformer));

        let first = app.handle(request("GET", MUTE, "10.0.0.1:1000")).await;
        assert_eq!(first.status(), StatusCode::Ok);
        assert_eq!(first.headers().get(X_CACHE), Some("MISS"));

        let second = app.handle(request("GET", MUTE, "10.0.0.1:1001")).await;
        assert_eq!(second.headers().get(X_CACHE), Some("HIT"));
        assert!(second.headers().get(X_CACHE_TTL).is_some());
        assert_eq!(second.headers().get("content-type"), Some("application/rss+xml"));
        assert_eq!(second.body_ref(), first.body_ref());
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 1);

        assert_eq!(app.cache().purge(), 1);
        let third = app.handle(request("GET", MUTE, "10.0.0.1:1002")).await;
        assert_eq!(third.headers().get(X_CACHE), Some("MISS"));
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Default)]
    struct SlowTimeout {
        calls: AtomicUsize,
    }

    impl FeedTransformer for SlowTimeout {
        fn transform(&self, _request: FeedRequest) -> BoxFuture<'_, Result<Feed, FeedError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(FeedError::Timeout)
            })
        }
    }

    #[tokio::test]
    async fn upstream_timeout_reaches_every_waiter_and_is_not_stored() {
        let transformer = Arc::new(SlowTimeout::default());
        let app = Arc::new(
            App::new(&Config::default(), Arc::clone(&transformer) as Arc<dyn FeedTransformer>, None)
                .unwrap(),
        );

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    app.handle(request("GET", MUTE, &format!("10.0.1.{i}:4000"))).await
                })
            })
            .collect();

        let mut bodies = Vec::new();
        for task in tasks {
            let response = task.await.unwrap();
            assert_eq!(response.status(), StatusCode::GatewayTimeout);
            bodies.push(response.body_ref().to_vec());
        }
        assert!(bodies.iter().all(|body| body == b"504 Gateway Timeout"));
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 1);

        let (path, query) = MUTE.split_once('?').unwrap();
        let key = CacheKey::new(path, Some(query)).unwrap();
        assert!(app.cache().lookup(&key).is_none());
        assert!(app.store().peek(key.as_str()).is_none());

        let retry = app.handle(request("GET", MUTE, "10.0.1.9:4000")).await;
        assert_eq!(retry.status(), StatusCode::GatewayTimeout);
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn burst_exhaustion_is_per_client() {
        let app = app(Arc::new(Counting::default()));

        for _ in 0..10 {
            let response = app.handle(request("GET", "/nope", "10.0.0.2:5000")).await;
            assert_eq!(response.status(), StatusCode::NotFound);
        }
        let denied = app.handle(request("GET", "/nope", "10.0.0.2:5001")).await;
        assert_eq!(denied.status(), StatusCode::TooManyRequests);
        assert!(denied.headers().get("retry-after").is_some());

        let other = app.handle(request("GET", "/nope", "10.0.0.3:5000")).await;
        assert_eq!(other.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn routing_outcomes() {
        let app = app(Arc::new(Counting::default()));

        let missing = app.handle(request("GET", "/nope", "10.0.0.4:1")).await;
        assert_eq!(missing.body_ref(), b"404 Not Found\n");

        let wrong = app.handle(request("POST", "/mute", "10.0.0.4:1")).await;
        assert_eq!(wrong.status(), StatusCode::MethodNotAllowed);
        assert_eq!(wrong.headers().get("allow"), Some("GET, HEAD"));
        assert_eq!(wrong.body_ref(), b"405 Method Not Allowed\n");

        let probe = app.handle(request("HEAD", "/mute", "10.0.0.4:1")).await;
        assert_eq!(probe.status(), StatusCode::NoContent);
        assert!(probe.body_ref().is_empty());

        let channel = app.handle(request("GET", "/tg/durov", "10.0.0.4:1")).await;
        assert_eq!(channel.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn head_mute_replays_a_cached_get() {
        let transformer = Arc::new(Counting::default());
        let app = app(Arc::clone(&transformer));

        let before = app.handle(request("HEAD", MUTE, "10.0.0.6:1")).await;
        assert_eq!(before.status(), StatusCode::NoContent);
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 0);

        let get = app.handle(request("GET", MUTE, "10.0.0.6:1")).await;
        assert_eq!(get.status(), StatusCode::Ok);

        let after = app.handle(request("HEAD", MUTE, "10.0.0.6:1")).await;
        assert_eq!(after.status(), StatusCode::Ok);
        assert_eq!(after.headers().get(X_CACHE), Some("HIT"));
        assert_eq!(after.headers().get("content-type"), Some("application/rss+xml"));
        assert_eq!(transformer.calls.load(Ordering::SeqCst), 1);

        let bare = app.handle(request("HEAD", "/mute", "10.0.0.6:1")).await;
        assert_eq!(bare.status(), StatusCode::NoContent);
    }

    #[tokio::test]
    async fn channel_route_requires_a_scraper() {
        let app = App::new(&Config::default(), Arc::new(Counting::default()), None).unwrap();
        let response = app.handle(request("GET", "/tg/durov", "10.0.0.5:1")).await;
        assert_eq!(response.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.rate_limit.burst = 0;
        assert!(App::new(&config, Arc::new(Counting::default()), None).is_err());
    }

    #[tokio::test]
    async fn serves_over_tcp_until_shutdown() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let app = app(Arc::new(Counting::default()));
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(app.serve(server, async {
            let _ = stopped.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 404"));

        stop.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
