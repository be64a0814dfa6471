//! Read-through caching for domain values, plus explicit invalidation.
//!
//! Responses go through [`CacheGate`](super::CacheGate); aggregates and
//! singleton records computed inside handlers go through [`remember`].
//! Long-lived singleton entries are dropped by [`InvalidationHooks`] when the
//! record behind them changes instead of waiting for their TTL.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{CacheEntry, CacheStore};

/// Returns the cached value under `key`, computing and storing it on a miss.
///
/// The value is stored as JSON. A store failure or an entry that no longer
/// decodes into `T` counts as a miss. Errors from `compute` are returned
/// as-is and nothing is stored.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use apicache::cache::{MemoryStore, remember};
///
/// # async fn demo() -> Result<(), std::convert::Infallible> {
/// let store = MemoryStore::new();
/// let total: u64 = remember(&store, "dashboard:revenue", Duration::from_secs(120), || async {
///     Ok::<_, std::convert::Infallible>(42)
/// })
/// .await?;
/// assert_eq!(total, 42);
/// # Ok(())
/// # }
/// ```
pub async fn remember<T, E, F, Fut>(
    store: &dyn CacheStore,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match store.get(key).await {
        Ok(Some(entry)) => match serde_json::from_slice::<T>(&entry.body) {
            Ok(value) => return Ok(value),
            Err(e) => debug!(key, error = %e, "stale cached value no longer decodes"),
        },
        Ok(None) => {}
        Err(e) => warn!(key, error = %e, "cache read failed, computing value"),
    }

    let value = compute().await?;

    match serde_json::to_vec(&value) {
        Ok(body) => {
            let entry = CacheEntry {
                key: key.to_string(),
                body: Bytes::from(body),
                status: 200,
                content_type: "application/json".to_string(),
                ttl_seconds: ttl.as_secs(),
            };
            if let Err(e) = store.put(key, entry, ttl).await {
                warn!(key, error = %e, "failed to cache computed value");
            }
        }
        Err(e) => warn!(key, error = %e, "computed value is not serializable"),
    }

    Ok(value)
}

/// Maps record kinds to the cache keys derived from them.
///
/// ```
/// use std::sync::Arc;
/// use apicache::cache::{InvalidationHooks, MemoryStore};
///
/// let hooks = InvalidationHooks::new(Arc::new(MemoryStore::new()));
/// hooks.register("coordinate", "coordinates:store");
/// assert_eq!(hooks.keys_for("coordinate"), vec!["coordinates:store".to_string()]);
/// ```
#[derive(Clone)]
pub struct InvalidationHooks {
    store: Arc<dyn CacheStore>,
    keys: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl InvalidationHooks {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Ties `key` to records of `kind`. Registering the same key twice is a
    /// no-op.
    pub fn register(&self, kind: impl Into<String>, key: impl Into<String>) {
        let key = key.into();
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let bucket = keys.entry(kind.into()).or_default();
        if !bucket.contains(&key) {
            bucket.push(key);
        }
    }

    pub fn keys_for(&self, kind: &str) -> Vec<String> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn record_saved(&self, kind: &str) -> usize {
        self.invalidate(kind, "saved").await
    }

    pub async fn record_deleted(&self, kind: &str) -> usize {
        self.invalidate(kind, "deleted").await
    }

    /// Forgets every key registered for `kind`. Returns how many entries
    /// were actually removed; store errors are logged and skipped.
    async fn invalidate(&self, kind: &str, event: &'static str) -> usize {
        let mut removed = 0;
        for key in self.keys_for(kind) {
            match self.store.forget(&key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(%kind, %key, error = %e, "failed to invalidate cache key"),
            }
        }
        debug!(%kind, event, removed, "cache invalidated");
        removed
    }
}
