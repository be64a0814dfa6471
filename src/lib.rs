//! # apicache
//!
//! A stampede-safe read-through response cache for JSON APIs, built as
//! middleware on a small async HTTP/1.1 framework.
//!
//! A cached route is a [`Pipeline`](middleware::Pipeline):
//!
//! ```text
//! Timeline → Freshness → Compression → CacheGate → endpoint
//! ```
//!
//! - [`cache::CacheGate`] serves anonymous `GET`s from a shared
//!   [`cache::CacheStore`], recomputing a cold key under a bounded lock.
//! - [`middleware::CompressionMiddleware`] brotli/gzip-encodes large JSON
//!   bodies when it pays off.
//! - [`middleware::FreshnessMiddleware`] adds `Cache-Control`, `Expires`
//!   and `ETag`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apicache::cache::{CacheGate, MemoryStore, ttl};
//! use apicache::config::CacheConfig;
//! use apicache::middleware::{CompressionMiddleware, FreshnessMiddleware, Pipeline};
//! use apicache::security::SessionMiddleware;
//! use apicache::{Method, Response, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_environment();
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let products = Pipeline::new(|_ctx| async {
//!         Response::json(StatusCode::OK, &serde_json::json!({"items": [1, 2, 3]}))
//!     })
//!     .with(SessionMiddleware::new(&config))
//!     .with(FreshnessMiddleware::new(ttl::API_DEFAULT, &config))
//!     .with(CompressionMiddleware::new(&config))
//!     .with(CacheGate::new(store, ttl::API_DEFAULT, &config));
//!
//!     let mut router = Router::new();
//!     router.mount(Method::Get, "/api/products", products.into_handler());
//!     let router = Arc::new(router);
//!
//!     Server::bind("127.0.0.1:8080")
//!         .await?
//!         .run(move |req| {
//!             let router = Arc::clone(&router);
//!             async move { router.route(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
