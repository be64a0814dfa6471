//! In-process [`CacheStore`] backed by [`DashMap`].
//!
//! Suitable for a single server process and for tests. Entries expire lazily
//! on read; [`MemoryStore::purge_expired`] (or the sweeper task) reclaims
//! memory for keys nobody reads again. All deadlines use
//! [`tokio::time::Instant`], so a paused test clock drives expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::store::{CacheLock, CacheStore};
use super::{CacheEntry, CacheError};

const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(10);

// Upper bound for any deadline; longer spans saturate here.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline(from: Instant, span: Duration) -> Instant {
    from.checked_add(span.min(FAR_FUTURE))
        .or_else(|| from.checked_add(Duration::from_secs(24 * 60 * 60)))
        .unwrap_or(from)
}

struct Slot {
    entry: CacheEntry,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    owner: u64,
    expires_at: Instant,
}

/// Process-local cache store.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    locks: Arc<DashMap<String, Lease>>,
    next_owner: AtomicU64,
    lock_poll: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            locks: Arc::new(DashMap::new()),
            next_owner: AtomicU64::new(1),
            lock_poll: DEFAULT_LOCK_POLL,
        }
    }

    /// How often a blocked [`CacheLock::try_acquire`] re-checks the lock.
    #[must_use]
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll = interval.max(Duration::from_millis(1));
        self
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries and lapsed lock leases. Returns how many
    /// entries were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.expires_at > now);
        self.locks.retain(|_, lease| lease.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `interval` until the
    /// store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "purged expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = Instant::now();
        {
            let Some(slot) = self.entries.get(key) else {
                return Ok(None);
            };
            if slot.expires_at > now {
                return Ok(Some(slot.entry.clone()));
            }
        }
        self.entries.remove_if(key, |_, slot| slot.expires_at <= now);
        Ok(None)
    }

    async fn put(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            self.entries.remove(key);
            return Ok(());
        }
        let expires_at = deadline(Instant::now(), ttl);
        self.entries.insert(key.to_string(), Slot { entry, expires_at });
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn lock(&self, name: &str, lease: Duration) -> Box<dyn CacheLock> {
        Box::new(MemoryLock {
            name: name.to_string(),
            owner: self.next_owner.fetch_add(1, Ordering::Relaxed),
            lease,
            poll: self.lock_poll,
            locks: Arc::clone(&self.locks),
        })
    }
}

struct MemoryLock {
    name: String,
    owner: u64,
    lease: Duration,
    poll: Duration,
    locks: Arc<DashMap<String, Lease>>,
}

impl MemoryLock {
    // Atomic check-and-set under the shard lock.
    fn try_claim(&self) -> bool {
        let now = Instant::now();
        let lease = Lease {
            owner: self.owner,
            expires_at: deadline(now, self.lease),
        };
        match self.locks.entry(self.name.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                true
            }
            Entry::Occupied(mut held) => {
                let current = *held.get();
                if current.owner == self.owner || current.expires_at <= now {
                    held.insert(lease);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[async_trait]
impl CacheLock for MemoryLock {
    async fn try_acquire(&self, wait: Duration) -> Result<bool, CacheError> {
        let give_up = deadline(Instant::now(), wait);
        loop {
            if self.try_claim() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= give_up {
                return Ok(false);
            }
            sleep(self.poll.min(give_up - now)).await;
        }
    }

    async fn release(&self) -> Result<(), CacheError> {
        self.locks
            .remove_if(&self.name, |_, lease| lease.owner == self.owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LockGuard;
    use bytes::Bytes;

    fn entry(body: &'static str) -> CacheEntry {
        CacheEntry {
            key: "k".into(),
            body: Bytes::from_static(body.as_bytes()),
            status: 200,
            content_type: "application/json".into(),
            ttl_seconds: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entry_lives_exactly_for_its_ttl() {
        let store = MemoryStore::new();
        store.put("k", entry("{}"), Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn put_overwrites_and_zero_ttl_removes() {
        let store = MemoryStore::new();
        store.put("k", entry("1"), Duration::from_secs(60)).await.unwrap();
        store.put("k", entry("2"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().body.as_ref(), b"2");

        store.put("k", entry("3"), Duration::ZERO).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_durations_saturate() {
        let store = MemoryStore::new();
        store.put("k", entry("{}"), Duration::MAX).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        let lock = store.lock("l", Duration::from_secs(u64::MAX));
        assert!(lock.try_acquire(Duration::MAX).await.unwrap());
        let rival = store.lock("l", Duration::from_secs(1));
        assert!(!rival.try_acquire(Duration::ZERO).await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn forget_reports_removal() {
        let store = MemoryStore::new();
        store.put("k", entry("{}"), Duration::from_secs(60)).await.unwrap();
        assert!(store.forget("k").await.unwrap());
        assert!(!store.forget("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_reclaims_expired_entries() {
        let store = MemoryStore::new();
        store.put("a", entry("{}"), Duration::from_secs(1)).await.unwrap();
        store.put("b", entry("{}"), Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let first = store.lock("l", Duration::from_secs(10));
        let second = store.lock("l", Duration::from_secs(10));

        assert!(first.try_acquire(Duration::ZERO).await.unwrap());
        assert!(!second.try_acquire(Duration::from_millis(200)).await.unwrap());

        first.release().await.unwrap();
        assert!(second.try_acquire(Duration::ZERO).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_when_holder_releases_inside_window() {
        let store = Arc::new(MemoryStore::new());
        let holder = store.lock("l", Duration::from_secs(10));
        assert!(holder.try_acquire(Duration::ZERO).await.unwrap());

        let waiter_store = Arc::clone(&store);
        let waiter = tokio::spawn(async move {
            waiter_store
                .lock("l", Duration::from_secs(10))
                .try_acquire(Duration::from_secs(2))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        holder.release().await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_is_taken_over() {
        let store = MemoryStore::new();
        let crashed = store.lock("l", Duration::from_secs(10));
        assert!(crashed.try_acquire(Duration::ZERO).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        let next = store.lock("l", Duration::from_secs(10));
        assert!(next.try_acquire(Duration::ZERO).await.unwrap());

        // The stale holder must not free the new owner's lock.
        crashed.release().await.unwrap();
        let third = store.lock("l", Duration::from_secs(10));
        assert!(!third.try_acquire(Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn dropped_guard_releases_lock() {
        let store = MemoryStore::new();
        let guard = LockGuard::acquire(&store, "l", Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();
        drop(guard);

        let other = store.lock("l", Duration::from_secs(10));
        assert!(other.try_acquire(Duration::from_millis(500)).await.unwrap());
    }

    #[tokio::test]
    async fn busy_lock_times_out() {
        let store = MemoryStore::new();
        let _held = LockGuard::acquire(&store, "l", Duration::from_secs(10), Duration::ZERO)
            .await
            .unwrap();
        let err = LockGuard::acquire(&store, "l", Duration::from_secs(10), Duration::from_millis(30))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::LockTimeout { .. }));
    }
}
