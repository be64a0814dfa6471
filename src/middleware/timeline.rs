//! Per-request timing breakdown.
//!
//! A profiled request gets a request id and a [`Profiled`] marker in its
//! context. The cache gate reports its own timings through `X-Perf-*`
//! headers; this stage folds them into one structured event:
//!
//! ```text
//! total = middleware + controller (next) + cache get + cache put + serialize
//! ```
//!
//! Only local and staging deployments send the breakdown back to the client.

use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use super::{BoxResponse, Middleware, Next};
use crate::Response;
use crate::cache::CACHE_STATUS_HEADER;
use crate::cache::gate::{
    PERF_CACHE_GET_HEADER, PERF_CACHE_PUT_HEADER, PERF_NEXT_HEADER, PERF_SERIALIZE_HEADER,
};
use crate::config::{CacheConfig, Environment};
use crate::context::Context;

/// Request header that opts a single request into profiling.
pub const PROFILE_REQUEST_HEADER: &str = "X-Perf";

/// Context marker for a request being profiled.
#[derive(Debug, Clone, Copy)]
pub struct Profiled {
    pub request_id: Uuid,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Breakdown {
    total_ms: f64,
    middleware_ms: f64,
    controller_ms: f64,
    cache_get_ms: f64,
    cache_put_ms: f64,
    serialize_ms: f64,
}

impl Breakdown {
    fn from_response(total_ms: f64, response: &Response) -> Self {
        let read = |name: &str| -> f64 {
            response
                .headers()
                .get(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0.0)
        };
        let controller_ms = read(PERF_NEXT_HEADER);
        let cache_get_ms = read(PERF_CACHE_GET_HEADER);
        let cache_put_ms = read(PERF_CACHE_PUT_HEADER);
        let serialize_ms = read(PERF_SERIALIZE_HEADER);
        let middleware_ms =
            (total_ms - controller_ms - cache_get_ms - cache_put_ms - serialize_ms).max(0.0);
        Self {
            total_ms,
            middleware_ms,
            controller_ms,
            cache_get_ms,
            cache_put_ms,
            serialize_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineMiddleware {
    environment: Environment,
    gate_profiling: bool,
}

impl TimelineMiddleware {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            environment: config.environment,
            gate_profiling: config.profiling,
        }
    }

    fn should_profile(&self, ctx: &Context) -> bool {
        self.environment == Environment::Local
            || ctx.request().headers().get(PROFILE_REQUEST_HEADER) == Some("1")
    }

    async fn profile(&self, mut ctx: Context, next: Next) -> Response {
        let request_id = Uuid::new_v4();
        ctx.extensions_mut().insert(Profiled { request_id });
        let method = ctx.request().method().to_string();
        let path = ctx.request().path().to_string();

        let started = Instant::now();
        let mut response = next.run(ctx).await;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        let breakdown = Breakdown::from_response(total_ms, &response);
        let cache = response
            .headers()
            .get(CACHE_STATUS_HEADER)
            .unwrap_or("BYPASS")
            .to_string();

        info!(
            %request_id,
            %method,
            %path,
            status = response.status().as_u16(),
            %cache,
            total_ms = breakdown.total_ms,
            middleware_ms = breakdown.middleware_ms,
            controller_ms = breakdown.controller_ms,
            cache_get_ms = breakdown.cache_get_ms,
            cache_put_ms = breakdown.cache_put_ms,
            serialize_ms = breakdown.serialize_ms,
            response_bytes = response.content().len(),
            "request timeline"
        );

        if self.environment.exposes_debug_headers() {
            let fmt = |ms: f64| format!("{ms:.2}");
            response.set_header("X-Perf-TotalMs", fmt(breakdown.total_ms));
            response.set_header("X-Perf-MiddlewareMs", fmt(breakdown.middleware_ms));
            response.set_header("X-Perf-ControllerMs", fmt(breakdown.controller_ms));
            response.set_header("X-Perf-RedisGetMs", fmt(breakdown.cache_get_ms));
            response.set_header("X-Perf-RedisPutMs", fmt(breakdown.cache_put_ms));
            response.set_header(PERF_SERIALIZE_HEADER, fmt(breakdown.serialize_ms));
            response.set_header("X-Perf-RequestId", request_id.to_string());
        } else if !self.gate_profiling {
            // The gate only reported these because of the marker.
            let headers = response.headers_mut();
            for name in [
                PERF_CACHE_GET_HEADER,
                PERF_CACHE_PUT_HEADER,
                PERF_SERIALIZE_HEADER,
                PERF_NEXT_HEADER,
            ] {
                headers.remove(name);
            }
        }
        response
    }
}

impl Middleware for TimelineMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let stage = self.clone();
        Box::pin(async move {
            if stage.should_profile(&ctx) {
                stage.profile(ctx, next).await
            } else {
                next.run(ctx).await
            }
        })
    }
}
