//! A small product catalog served through the full cache pipeline.
//!
//! ```text
//! cargo run --example catalog_server
//! curl -si -H 'Accept-Encoding: br, gzip' http://127.0.0.1:8080/api/products?page=1
//! ```
//!
//! Set `APICACHE_ENV=local` to see the `X-Perf-*` breakdown.

use std::sync::Arc;
use std::time::Duration;

use apicache::cache::{CacheGate, CacheWarmer, InvalidationHooks, MemoryStore, remember, ttl};
use apicache::config::CacheConfig;
use apicache::context::Context;
use apicache::middleware::{
    CompressionMiddleware, FreshnessMiddleware, LoggerMiddleware, Pipeline, TimelineMiddleware,
};
use apicache::security::SessionMiddleware;
use apicache::{Method, Response, Router, Server, StatusCode};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct Product {
    id: u32,
    name: String,
    price_cents: u64,
}

#[derive(Serialize, serde::Deserialize)]
struct StoreCoordinates {
    lat: f64,
    lng: f64,
}

async fn list_products(ctx: Context) -> Response {
    let page: u32 = ctx
        .request()
        .query_param("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);

    // Stand-in for a slow query.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let items: Vec<Product> = (0..40)
        .map(|i| Product {
            id: (page - 1) * 40 + i,
            name: format!("Whey protein, flavour #{i}"),
            price_cents: 2_499 + u64::from(i) * 10,
        })
        .collect();
    Response::json(StatusCode::OK, &serde_json::json!({ "page": page, "items": items }))
}

/// Wraps `endpoint` in the standard cached-route stack.
fn cached<H, F>(endpoint: H, ttl: Duration, store: &Arc<MemoryStore>, config: &CacheConfig) -> Pipeline
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Pipeline::new(endpoint)
        .with(LoggerMiddleware)
        .with(TimelineMiddleware::new(config))
        .with(SessionMiddleware::new(config))
        .with(FreshnessMiddleware::new(ttl, config))
        .with(CompressionMiddleware::new(config))
        .with(CacheGate::new(store.clone(), ttl, config))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,apicache=debug")),
        )
        .init();

    let config = CacheConfig::from_environment();
    let store = Arc::new(MemoryStore::new());
    let _sweeper = store.spawn_sweeper(Duration::from_secs(30));

    let hooks = InvalidationHooks::new(store.clone());
    hooks.register("coordinates", "store:coordinates");

    let mut router = Router::new();
    router.mount(
        Method::Get,
        "/api/products",
        cached(list_products, ttl::API_DEFAULT, &store, &config).into_handler(),
    );

    let singleton_store = store.clone();
    router.get("/api/store/coordinates", move |_ctx| {
        let store = singleton_store.clone();
        async move {
            let coordinates = remember(
                store.as_ref(),
                "store:coordinates",
                ttl::SINGLETON,
                || async { Ok::<_, std::convert::Infallible>(StoreCoordinates { lat: 52.37, lng: 4.89 }) },
            )
            .await;
            match coordinates {
                Ok(c) => Response::json(StatusCode::OK, &c),
                Err(never) => match never {},
            }
        }
    });

    router.post("/api/store/coordinates", move |_ctx| {
        let hooks = hooks.clone();
        async move {
            let dropped = hooks.record_saved("coordinates").await;
            Response::json(StatusCode::OK, &serde_json::json!({ "invalidated": dropped }))
        }
    });

    let router = Arc::new(router);
    let server = Server::bind("127.0.0.1:8080").await?;

    let warm_router = Arc::clone(&router);
    let warmer = CacheWarmer::new(move |req| {
        let router = Arc::clone(&warm_router);
        async move { router.route(req).await }
    })
    .with_host(server.local_addr().to_string());
    let report = warmer.warm(["/api/products?page=1", "/api/products?page=2"]).await;
    tracing::info!(warmed = report.warmed(), failed = report.failed(), "startup warm-up");

    server
        .run_until(
            move |req| {
                let router = Arc::clone(&router);
                async move { router.route(req).await }
            },
            async {
                let _ = tokio::signal::ctrl_c().await;
            },
        )
        .await?;
    Ok(())
}
