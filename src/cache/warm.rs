//! Priming cache entries ahead of traffic.
//!
//! The warmer replays anonymous `GET`s through the same handler real clients
//! hit, so every entry is produced by the normal [`CacheGate`](super::CacheGate)
//! path with the route's own TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::CacheStatus;
use crate::middleware::BoxResponse;
use crate::{Request, Response, StatusCode};

type WarmHandler = Arc<dyn Fn(Request) -> BoxResponse + Send + Sync>;

/// Result of warming one path.
#[derive(Debug, Clone)]
pub struct WarmOutcome {
    pub path: String,
    pub status: StatusCode,
    /// `None` when the route is not behind a cache gate.
    pub cache_status: Option<CacheStatus>,
    pub elapsed: Duration,
}

impl WarmOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WarmReport {
    pub outcomes: Vec<WarmOutcome>,
}

impl WarmReport {
    pub fn warmed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.warmed()
    }
}

/// Replays a list of paths through a handler.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use apicache::Router;
/// use apicache::cache::CacheWarmer;
///
/// # async fn demo(router: Router) {
/// let router = Arc::new(router);
/// let warmer = CacheWarmer::new(move |req| {
///     let router = Arc::clone(&router);
///     async move { router.route(req).await }
/// })
/// .with_host("shop.local");
/// let report = warmer.warm(["/api/products", "/api/dashboard/metrics"]).await;
/// assert_eq!(report.failed(), 0);
/// # }
/// ```
#[derive(Clone)]
pub struct CacheWarmer {
    handler: WarmHandler,
    host: String,
}

impl CacheWarmer {
    pub fn new<H, F>(handler: H) -> Self
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |req: Request| -> BoxResponse { Box::pin(handler(req)) }),
            host: "localhost".to_string(),
        }
    }

    /// `Host` sent with each request. It is part of the cache key, so it has
    /// to match what real clients send.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Requests each path once, in order.
    pub async fn warm<I, P>(&self, paths: I) -> WarmReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let mut report = WarmReport::default();
        for path in paths {
            let path = path.as_ref();
            let request = Request::get(path).with_header("Host", self.host.as_str());

            let started = Instant::now();
            let response = (self.handler)(request).await;
            let outcome = WarmOutcome {
                path: path.to_string(),
                status: response.status(),
                cache_status: CacheStatus::of(&response),
                elapsed: started.elapsed(),
            };

            if outcome.is_success() {
                info!(
                    path,
                    status = outcome.status.as_u16(),
                    cache = outcome.cache_status.map_or("BYPASS", CacheStatus::as_str),
                    elapsed = ?outcome.elapsed,
                    "warmed"
                );
            } else {
                warn!(path, status = outcome.status.as_u16(), "warming failed");
            }
            report.outcomes.push(outcome);
        }
        info!(warmed = report.warmed(), failed = report.failed(), "cache warming complete");
        report
    }
}
