//! Middleware pipeline: request handling split into composable layers.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration without coupling
//! handlers to infrastructure concerns. The cached API route is assembled
//! from these pieces:
//!
//! ```text
//! TimelineMiddleware → FreshnessMiddleware → CompressionMiddleware → CacheGate → endpoint
//! ```
//!
//! ## Core types
//!
//! - [`Middleware`]: the trait every stage implements.
//! - [`Next`]: cursor into the remaining chain, advanced by [`Next::run`].
//! - [`Pipeline`]: ordered middleware plus the terminal endpoint.
//! - [`MiddlewareHandler`]: a type-erased middleware function.
//! - [`LoggerMiddleware`]: one log line per request.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{
    Response, StatusCode,
    context::Context,
    router::{Handler, handler},
};

pub mod compression;
pub mod freshness;
pub mod timeline;

pub use compression::CompressionMiddleware;
pub use freshness::FreshnessMiddleware;
pub use timeline::TimelineMiddleware;

/// Boxed response future returned by every middleware.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the
/// next middleware, or the endpoint once every middleware has run. A chain
/// without an endpoint answers `500`.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    endpoint: Option<Handler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a cursor at the start of `middlewares`, ending in `endpoint`.
    pub fn new(middlewares: Vec<MiddlewareHandler>, endpoint: Option<Handler>) -> Self {
        Self {
            middlewares,
            endpoint,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// Once the middleware list is exhausted the endpoint runs. If there is
    /// no endpoint, a `500 Internal Server Error` is returned.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else if let Some(endpoint) = self.endpoint.take() {
            endpoint(ctx).await
        } else {
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`
///   (a cache hit does this).
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// Implementations must be `Send + Sync` because middleware is shared across
/// Tokio tasks, and should not hold locks across an `.await` point.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// An endpoint wrapped in an ordered middleware stack.
///
/// Middleware added first runs first (outermost).
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use apicache::{Response, StatusCode};
/// use apicache::cache::{CacheGate, MemoryStore, ttl};
/// use apicache::config::CacheConfig;
/// use apicache::middleware::{CompressionMiddleware, FreshnessMiddleware, Pipeline};
///
/// let config = CacheConfig::default();
/// let store = Arc::new(MemoryStore::new());
/// let pipeline = Pipeline::new(|_ctx| async {
///         Response::json(StatusCode::OK, &serde_json::json!({"items": [1, 2, 3]}))
///     })
///     .with(FreshnessMiddleware::new(ttl::API_DEFAULT, &config))
///     .with(CompressionMiddleware::new(&config))
///     .with(CacheGate::new(store, ttl::API_DEFAULT, &config));
/// ```
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
    endpoint: Handler,
}

impl Pipeline {
    pub fn new<H, F>(endpoint: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        Self {
            middlewares: Vec::new(),
            endpoint: handler(endpoint),
        }
    }

    /// Appends `middleware` inside everything added so far.
    #[must_use]
    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Runs the full chain for one request.
    pub fn handle(&self, ctx: Context) -> BoxResponse {
        let next = Next::new(self.middlewares.clone(), Some(self.endpoint.clone()));
        Box::pin(next.run(ctx))
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Erases the pipeline into a router [`Handler`].
    pub fn into_handler(self) -> Handler {
        Arc::new(move |ctx: Context| self.handle(ctx))
    }
}

/// Built-in middleware that logs each request's method, path, status,
/// cache status, and duration.
///
/// Emits one event after the downstream handler completes, at `warn` for
/// server errors and `info` otherwise.
/// Requests that bypassed the cache are logged with `cache = "BYPASS"`.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let cache = response
                .headers()
                .get(crate::cache::CACHE_STATUS_HEADER)
                .unwrap_or("BYPASS")
                .to_string();
            let status = response.status();
            if status.is_server_error() {
                tracing::warn!(
                    %method,
                    %path,
                    status = status.as_u16(),
                    %cache,
                    duration = ?start.elapsed(),
                    "request failed"
                );
            } else {
                tracing::info!(
                    %method,
                    %path,
                    status = status.as_u16(),
                    %cache,
                    duration = ?start.elapsed(),
                    "request served"
                );
            }

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
            let tag = self.0;
            Box::pin(async move {
                let mut resp = next.run(ctx).await;
                resp.add_header("X-Trail", tag);
                resp
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxResponse {
            Box::pin(async { Response::new(StatusCode::FORBIDDEN) })
        }
    }

    #[tokio::test]
    async fn outermost_middleware_decorates_last() {
        let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::OK) })
            .with(Tag("outer"))
            .with(Tag("inner"));
        let resp = pipeline.handle(Context::new(Request::get("/"))).await;
        let trail: Vec<_> = resp.headers().get_all("x-trail").collect();
        assert_eq!(trail, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::OK) })
            .with(Tag("outer"))
            .with(Deny);
        let resp = pipeline.handle(Context::new(Request::get("/"))).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.headers().get("x-trail"), Some("outer"));
    }

    #[tokio::test]
    async fn chain_without_endpoint_answers_500() {
        let resp = Next::new(vec![], None)
            .run(Context::new(Request::get("/")))
            .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::ACCEPTED) })
            .with(LoggerMiddleware);
        let resp = pipeline.handle(Context::new(Request::get("/"))).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
