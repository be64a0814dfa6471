//! Client and proxy freshness headers for successful `GET` responses.

use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use super::{BoxResponse, Middleware, Next};
use crate::config::CacheConfig;
use crate::context::Context;
use crate::{Method, Response, StatusCode};

// Largest delta-seconds a cache must accept (RFC 9111 1.2.2); longer ages saturate.
const MAX_DELTA_SECONDS: u64 = 1 << 31;

/// Adds `Cache-Control`, `Expires` and (for small bodies) `ETag`.
///
/// Runs outside the compression stage, so the ETag identifies the bytes as
/// they go on the wire.
#[derive(Debug, Clone)]
pub struct FreshnessMiddleware {
    max_age: Duration,
    etag_max_bytes: usize,
}

impl FreshnessMiddleware {
    pub fn new(max_age: Duration, config: &CacheConfig) -> Self {
        Self {
            max_age,
            etag_max_bytes: config.etag_max_bytes,
        }
    }

    /// Stamps `response` as fresh for `max_age` from `now`.
    pub fn stamp(&self, response: &mut Response, now: SystemTime) {
        let secs = self.max_age.as_secs().min(MAX_DELTA_SECONDS);
        response.set_header(
            "Cache-Control",
            format!("public, max-age={secs}, s-maxage={secs}"),
        );
        let expires = now.checked_add(Duration::from_secs(secs)).unwrap_or(now);
        response.set_header("Expires", httpdate::fmt_http_date(expires));

        if !response.headers().contains("ETag") && response.content().len() < self.etag_max_bytes {
            let digest = Sha256::digest(response.content());
            response.set_header("ETag", format!("\"{digest:x}\""));
        }
    }
}

impl Middleware for FreshnessMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let stage = self.clone();
        Box::pin(async move {
            let is_get = ctx.request().method() == &Method::Get;
            let mut response = next.run(ctx).await;
            if is_get && response.status() == StatusCode::OK {
                stage.stamp(&mut response, SystemTime::now());
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::middleware::Pipeline;

    fn stage(max_age: u64) -> FreshnessMiddleware {
        FreshnessMiddleware::new(Duration::from_secs(max_age), &CacheConfig::default())
    }

    fn json(len: usize) -> Response {
        Response::new(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(format!("\"{}\"", "x".repeat(len - 2)))
    }

    #[test]
    fn cache_control_and_expires() {
        let mut resp = json(32);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        stage(300).stamp(&mut resp, now);

        assert_eq!(
            resp.headers().get("Cache-Control"),
            Some("public, max-age=300, s-maxage=300")
        );
        let expires = httpdate::parse_http_date(resp.headers().get("Expires").unwrap()).unwrap();
        assert_eq!(expires, now + Duration::from_secs(300));
    }

    #[test]
    fn huge_max_age_saturates() {
        let mut resp = json(32);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        stage(u64::MAX).stamp(&mut resp, now);

        assert_eq!(
            resp.headers().get("Cache-Control"),
            Some("public, max-age=2147483648, s-maxage=2147483648")
        );
        let expires = httpdate::parse_http_date(resp.headers().get("Expires").unwrap()).unwrap();
        assert_eq!(expires, now + Duration::from_secs(1 << 31));
    }

    #[test]
    fn etag_only_under_size_guard() {
        let mut small = json(50_000);
        stage(60).stamp(&mut small, SystemTime::now());
        let etag = small.headers().get("ETag").unwrap();
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag.len(), 66);

        let mut large = json(150_000);
        stage(60).stamp(&mut large, SystemTime::now());
        assert!(!large.headers().contains("ETag"));
    }

    #[test]
    fn existing_etag_is_kept() {
        let mut resp = json(10).header("ETag", "\"v1\"");
        stage(60).stamp(&mut resp, SystemTime::now());
        assert_eq!(resp.headers().get("ETag"), Some("\"v1\""));
    }

    #[test]
    fn same_body_same_etag() {
        let mut a = json(100);
        let mut b = json(100);
        stage(60).stamp(&mut a, SystemTime::now());
        stage(60).stamp(&mut b, SystemTime::now());
        assert_eq!(a.headers().get("ETag"), b.headers().get("ETag"));
    }

    #[tokio::test]
    async fn only_successful_gets_are_stamped() {
        let ok = Pipeline::new(|_ctx| async { json(10) }).with(stage(60));
        let resp = ok.handle(Context::new(Request::get("/p"))).await;
        assert!(resp.headers().contains("Cache-Control"));

        let post = ok
            .handle(Context::new(Request::new(Method::Post, "/p")))
            .await;
        assert!(!post.headers().contains("Cache-Control"));

        let created = Pipeline::new(|_ctx| async { Response::new(StatusCode::CREATED) })
            .with(stage(60));
        let resp = created.handle(Context::new(Request::get("/p"))).await;
        assert!(!resp.headers().contains("Cache-Control"));
        assert!(!resp.headers().contains("ETag"));
    }
}
