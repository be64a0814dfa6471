//! Method and path routing.
//!
//! Two pattern styles are supported:
//!
//! | Pattern              | Example match              | Captured params |
//! |----------------------|----------------------------|-----------------|
//! | `/products`          | `/products`                | *(none)*        |
//! | `/products/:slug`    | `/products/whey-gold`      | `slug → "whey-gold"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths. The
//! query string never takes part in matching.
//!
//! Cache policy is per route: mount a [`Pipeline`](crate::middleware::Pipeline)
//! built with the TTL that suits the resource.

use std::future::Future;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::BoxResponse;
use crate::{Method, Request, Response, StatusCode};

/// Type-erased async handler that turns a [`Context`] into a [`Response`].
pub type Handler = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

/// Boxes an async function into a [`Handler`].
pub fn handler<H, F>(f: H) -> Handler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context| -> BoxResponse { Box::pin(f(ctx)) })
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Parameter(name.to_string()),
                None => Segment::Static(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Static(s) if s == part => {}
                Segment::Static(_) => return None,
                Segment::Parameter(name) => params.insert(name.clone(), part.to_string()),
            }
        }
        Some(params)
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// HTTP request router.
///
/// Routes are evaluated in registration order; the first route whose method
/// and pattern both match wins. A path that matches only under another
/// method answers `405`, anything else `404`.
///
/// # Examples
///
/// ```rust,no_run
/// use apicache::{Router, Response, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/ping", |_ctx| async { Response::new(StatusCode::OK) });
/// router.get("/products/:slug", |ctx| async move {
///     let slug = ctx.params().get("slug").unwrap_or_default().to_owned();
///     Response::new(StatusCode::OK).body(slug)
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

    /// Registers an async function for `GET` requests matching `path`.
    pub fn get<H, F>(&mut self, path: &str, f: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.mount(Method::Get, path, handler(f));
    }

    /// Registers an async function for `POST` requests matching `path`.
    pub fn post<H, F>(&mut self, path: &str, f: H)
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.mount(Method::Post, path, handler(f));
    }

    /// Registers an already-erased handler, typically
    /// [`Pipeline::into_handler`](crate::middleware::Pipeline::into_handler).
    pub fn mount(&mut self, method: Method, path: &str, handler: Handler) {
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

    /// Dispatches `request` to the first matching route.
    pub async fn route(&self, request: Request) -> Response {
        let mut path_matched = false;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(request.path()) else {
                continue;
            };
            if &route.method != request.method() {
                path_matched = true;
                continue;
            }
            let ctx = Context::with_params(request, params);
            return (route.handler)(ctx).await;
        }

        if path_matched {
            Response::new(StatusCode::METHOD_NOT_ALLOWED)
        } else {
            Response::new(StatusCode::NOT_FOUND)
        }
    }
}
