//! Read-through HTTP response cache with stampede protection.
//!
//! - [`key`] derives namespaced keys from the request method and full URL.
//! - [`store`] defines the pluggable [`CacheStore`] / [`CacheLock`] contract
//!   and the scoped [`LockGuard`]; [`memory`] is the in-process store.
//! - [`materialize`] decides whether a response may be stored.
//! - [`gate`] is the [`CacheGate`] middleware tying it together.
//! - [`remember`] caches domain values with explicit invalidation hooks.
//! - [`warm`] primes entries ahead of traffic.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Response, StatusCode};

pub mod error;
pub mod gate;
pub mod key;
pub mod materialize;
pub mod memory;
pub mod remember;
pub mod store;
pub mod warm;

pub use error::CacheError;
pub use gate::CacheGate;
pub use key::CacheKey;
pub use materialize::ContentKind;
pub use memory::MemoryStore;
pub use remember::{InvalidationHooks, remember};
pub use store::{CacheLock, CacheStore, LockGuard};
pub use warm::{CacheWarmer, WarmReport};

/// Response header carrying [`CacheStatus`].
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Per-route TTL presets.
pub mod ttl {
    use std::time::Duration;

    /// Generic API listings.
    pub const API_DEFAULT: Duration = Duration::from_secs(300);
    /// Dashboard aggregates; they change with every order.
    pub const DASHBOARD_METRICS: Duration = Duration::from_secs(120);
    /// Near-static singleton records, invalidated explicitly on save/delete.
    pub const SINGLETON: Duration = Duration::from_secs(3600);
    /// Operational alert counters.
    pub const OPERATIONAL_ALERTS: Duration = Duration::from_secs(60);
}

/// Whether a response came out of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }

    /// Reads the status stamped on a response, if the gate handled it.
    pub fn of(response: &Response) -> Option<Self> {
        response.headers().get(CACHE_STATUS_HEADER)?.parse().ok()
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "HIT" => Ok(Self::Hit),
            "MISS" => Ok(Self::Miss),
            _ => Err(()),
        }
    }
}

/// One stored response.
///
/// The body is kept exactly as it was first serialized; a hit never runs
/// application serialization again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub body: Bytes,
    pub status: u16,
    pub content_type: String,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Rebuilds the response a hit is served from.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response::new(status)
            .header("Content-Type", self.content_type.as_str())
            .body_bytes(self.body.clone())
    }
}
