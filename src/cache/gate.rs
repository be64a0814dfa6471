//! Stampede-safe read-through cache middleware.
//!
//! ```text
//! GET, anonymous ──► lookup ──hit──► HIT
//!                      │miss
//!                      ▼
//!               lock (≤ lock_wait)
//!          acquired │          │ timed out
//!                   ▼          ▼
//!              re-check     sleep(retry), re-check
//!            hit│  │miss      hit│   │miss
//!               ▼  ▼            ▼   ▼
//!             HIT  run + store  HIT  run + store (no lock)
//!                  release            MISS
//!                  MISS
//! ```
//!
//! The lock bounds duplicate recomputation; it does not eliminate it. A
//! caller that loses the lock race for longer than the wait window runs the
//! handler anyway so latency stays bounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::materialize::materialize;
use super::store::{CacheStore, LockGuard};
use super::{CACHE_STATUS_HEADER, CacheEntry, CacheError, CacheStatus};
use crate::config::CacheConfig;
use crate::context::Context;
use crate::middleware::timeline::Profiled;
use crate::middleware::{BoxResponse, Middleware, Next};
use crate::{Method, Response};

pub const PERF_CACHE_GET_HEADER: &str = "X-Perf-CacheGetMs";
pub const PERF_CACHE_PUT_HEADER: &str = "X-Perf-CachePutMs";
pub const PERF_SERIALIZE_HEADER: &str = "X-Perf-SerializeMs";
pub const PERF_NEXT_HEADER: &str = "X-Perf-NextMs";

#[derive(Debug, Default, Clone, Copy)]
struct Timings {
    lookup: Duration,
    serialize: Duration,
    store: Duration,
    downstream: Duration,
}

/// Read-through cache in front of a downstream handler.
///
/// Only anonymous `GET` requests are considered; everything else is
/// forwarded without touching the store. Store failures degrade to serving
/// uncached and are logged, never surfaced.
#[derive(Clone)]
pub struct CacheGate {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    lock_lease: Duration,
    lock_wait: Duration,
    contention_retry: Duration,
    enabled: bool,
    profiling: bool,
}

impl CacheGate {
    /// Creates a gate storing responses for `ttl`; lock timings and switches
    /// come from `config`.
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration, config: &CacheConfig) -> Self {
        Self {
            store,
            ttl,
            lock_lease: config.lock_lease(),
            lock_wait: config.lock_wait(),
            contention_retry: config.contention_retry(),
            enabled: config.enabled,
            profiling: config.profiling,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Serves one request through the cache.
    pub async fn serve(&self, ctx: Context, next: Next) -> Response {
        if !self.is_eligible(&ctx) {
            return next.run(ctx).await;
        }

        let key = CacheKey::for_request(ctx.request());
        let entry_key = key.entry_key();
        let profiled = self.profiling || ctx.extensions().contains::<Profiled>();
        let mut timings = Timings::default();

        let started = Instant::now();
        let cached = self.lookup(&entry_key).await;
        timings.lookup = started.elapsed();
        if let Some(entry) = cached {
            return self.hit(&entry, &timings, profiled);
        }

        let guard = match LockGuard::acquire(
            self.store.as_ref(),
            &key.lock_key(),
            self.lock_lease,
            self.lock_wait,
        )
        .await
        {
            Ok(guard) => {
                // Whoever held the lock before us may have just filled the entry.
                if let Some(entry) = self.lookup(&entry_key).await {
                    release(guard).await;
                    return self.hit(&entry, &timings, profiled);
                }
                Some(guard)
            }
            Err(CacheError::LockTimeout { .. }) => {
                debug!(key = %entry_key, "recomputation lock busy, retrying cache once");
                tokio::time::sleep(self.contention_retry).await;
                if let Some(entry) = self.lookup(&entry_key).await {
                    return self.hit(&entry, &timings, profiled);
                }
                None
            }
            Err(e) => {
                warn!(key = %entry_key, error = %e, "cache lock unavailable, serving uncached");
                None
            }
        };

        let url = ctx.request().full_url();
        let started = Instant::now();
        let mut response = next.run(ctx).await;
        timings.downstream = started.elapsed();

        self.store_response(&entry_key, &url, &response, &mut timings)
            .await;
        if let Some(guard) = guard {
            release(guard).await;
        }

        self.stamp(&mut response, CacheStatus::Miss, &timings, profiled);
        response
    }

    fn is_eligible(&self, ctx: &Context) -> bool {
        self.enabled && ctx.request().method() == &Method::Get && !ctx.is_authenticated()
    }

    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn store_response(
        &self,
        key: &str,
        url: &str,
        response: &Response,
        timings: &mut Timings,
    ) {
        let started = Instant::now();
        let entry = match materialize(key, response, self.ttl) {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                debug!(%url, error = %e, "response not cached");
                return;
            }
        };
        timings.serialize = started.elapsed();

        let started = Instant::now();
        if let Err(e) = self.store.put(key, entry, self.ttl).await {
            warn!(%url, error = %e, "failed to cache response");
            return;
        }
        timings.store = started.elapsed();
    }

    fn hit(&self, entry: &CacheEntry, timings: &Timings, profiled: bool) -> Response {
        let mut response = entry.to_response();
        let lookup_only = Timings {
            lookup: timings.lookup,
            ..Timings::default()
        };
        self.stamp(&mut response, CacheStatus::Hit, &lookup_only, profiled);
        response
    }

    fn stamp(&self, response: &mut Response, status: CacheStatus, timings: &Timings, profiled: bool) {
        response.set_header(CACHE_STATUS_HEADER, status.as_str());
        if profiled {
            response.set_header(PERF_CACHE_GET_HEADER, millis(timings.lookup));
            response.set_header(PERF_CACHE_PUT_HEADER, millis(timings.store));
            response.set_header(PERF_SERIALIZE_HEADER, millis(timings.serialize));
            response.set_header(PERF_NEXT_HEADER, millis(timings.downstream));
        }
    }
}

impl Middleware for CacheGate {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let gate = self.clone();
        Box::pin(async move { gate.serve(ctx, next).await })
    }
}

async fn release(guard: LockGuard) {
    let name = guard.name().to_string();
    if let Err(e) = guard.release().await {
        warn!(lock = %name, error = %e, "failed to release cache lock");
    }
}

fn millis(d: Duration) -> String {
    format!("{:.2}", d.as_secs_f64() * 1000.0)
}
