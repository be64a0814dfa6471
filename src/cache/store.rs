//! The shared cache store contract.
//!
//! The gate never holds in-process state between requests; every bit of
//! coordination goes through a [`CacheStore`]: atomic get, atomic
//! put-with-TTL, and an advisory lock with bounded acquisition.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{CacheEntry, CacheError};

/// A shared key/value store with TTLs and advisory locks.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live entry for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores `entry` under `key`, replacing any previous value. A zero
    /// `ttl` removes the key instead.
    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError>;

    /// Removes `key`. Returns `true` if something was removed.
    async fn forget(&self, key: &str) -> Result<bool, CacheError>;

    /// Creates a handle for the lock `name`. No store round trip happens
    /// until the handle is used.
    fn lock(&self, name: &str, lease: Duration) -> Box<dyn CacheLock>;
}

/// Handle to one advisory lock.
///
/// A lease bounds how long a holder may keep the lock; after that the next
/// acquirer takes it over even without a release.
#[async_trait]
pub trait CacheLock: Send + Sync {
    /// Tries to acquire, blocking for at most `wait`. `Ok(false)` means the
    /// window closed while someone else held the lock.
    async fn try_acquire(&self, wait: Duration) -> Result<bool, CacheError>;

    /// Releases the lock if this handle still owns it.
    async fn release(&self) -> Result<(), CacheError>;
}

/// A held lock that is released on every exit path.
///
/// Call [`release`](Self::release) on the normal paths. If the guard is
/// dropped while still held (a cancelled request, a panicking handler), the
/// release is spawned onto the current Tokio runtime.
pub struct LockGuard {
    name: String,
    lock: Option<Box<dyn CacheLock>>,
}

impl LockGuard {
    /// Acquires `name` within `wait`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::LockTimeout`] if the lock stayed busy for the whole window.
    /// - [`CacheError::StoreUnavailable`] if the store failed.
    pub async fn acquire(
        store: &dyn CacheStore,
        name: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Self, CacheError> {
        let lock = store.lock(name, lease);
        if lock.try_acquire(wait).await? {
            Ok(Self {
                name: name.to_string(),
                lock: Some(lock),
            })
        } else {
            Err(CacheError::LockTimeout {
                key: name.to_string(),
                waited: wait,
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<(), CacheError> {
        match self.lock.take() {
            Some(lock) => lock.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release().await {
                        warn!(lock = %name, error = %e, "failed to release dropped cache lock");
                    }
                });
            }
            // Outside a runtime the lease expiry frees the lock.
            Err(_) => warn!(lock = %name, "cache lock dropped outside a runtime"),
        }
    }
}
