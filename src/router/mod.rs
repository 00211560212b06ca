//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! | Pattern        | Example match          | Captured params          |
//! |----------------|------------------------|--------------------------|
//! | `/mute`        | `/mute`                | *(none)*                 |
//! | `/tg/:name`    | `/tg/durov`            | `name → "durov"`         |
//! | `/static/*`    | `/static/css/app.css`  | `wildcard → "/css/app.css"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths. Routes
//! are matched in registration order. A path that matches some route under a
//! different method yields `405 Method Not Allowed` with an `Allow` header;
//! anything else unmatched yields `404 Not Found`.

use std::future::Future;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::{BoxResponse, MiddlewareHandler, Next};
use crate::{Method, Response, StatusCode};

/// Type-erased async route handler.
pub type Handler = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

impl Pattern {
    /// Compiles a pattern string. `/*` suffixes become wildcards, `:name`
    /// segments become captures, everything else is matched literally.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_owned());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_owned()),
                    None => Segment::Static(s.to_owned()),
                })
                .collect();
            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_owned())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != parts.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (segment, part) in segments.iter().zip(parts) {
                    match segment {
                        Segment::Static(s) if s != part => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => params.insert(name.clone(), part.to_owned()),
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => path.strip_prefix(prefix.as_str()).map(|suffix| {
                let mut params = PathParams::new();
                params.insert("wildcard".to_owned(), suffix.to_owned());
                params
            }),
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust,no_run
/// use feedgate::{Context, Response, Router, StatusCode};
///
/// let mut router = Router::new();
/// router.head("/mute", |_ctx| async { Response::new(StatusCode::NoContent) });
/// router.get("/tg/:name", |ctx: Context| async move {
///     let name = ctx.params().get("name").unwrap_or_default().to_owned();
///     Response::new(StatusCode::Ok).body(name)
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `GET` requests matching `path`.
    pub fn get<H, F>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Get, path, handler);
    }

    /// Registers a handler for `HEAD` requests matching `path`.
    pub fn head<H, F>(&mut self, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.route(Method::Head, path, handler);
    }

    /// Registers a handler for an arbitrary method.
    pub fn route<H, F>(&mut self, method: Method, path: &str, handler: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx| -> BoxResponse { Box::pin(handler(ctx)) });
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `ctx` to the first route whose method and pattern match.
    pub async fn dispatch(&self, mut ctx: Context) -> Response {
        let mut allowed: Vec<&str> = Vec::new();

        for route in &self.routes {
            let Some(params) = route.pattern.matches(ctx.request().path()) else {
                continue;
            };
            if &route.method == ctx.request().method() {
                ctx.set_params(params);
                return (route.handler)(ctx).await;
            }
            if !allowed.contains(&route.method.as_str()) {
                allowed.push(route.method.as_str());
            }
        }

        if allowed.is_empty() {
            Response::new(StatusCode::NotFound).body("404 Not Found\n")
        } else {
            Response::new(StatusCode::MethodNotAllowed)
                .header("Allow", allowed.join(", "))
                .body("405 Method Not Allowed\n")
        }
    }

    /// Turns the router into the terminal element of a middleware chain.
    pub fn into_middleware(self) -> MiddlewareHandler {
        let router = Arc::new(self);
        Arc::new(move |ctx: Context, _next: Next| -> BoxResponse {
            let router = Arc::clone(&router);
            Box::pin(async move { router.dispatch(ctx).await })
        })
    }
}
