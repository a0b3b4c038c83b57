//! Coalescing TTL cache.
//!
//! [`CoalescingCache::get_or_compute`] returns a live entry when there is
//! one. On a miss, the first caller for a key installs a shared in-flight
//! computation; every concurrent caller for the same key awaits that one
//! computation and receives the same success or failure. Only successes are
//! stored. Unrelated keys compute independently.
//!
//! An in-flight computation lives as long as someone awaits it. When the
//! last waiter goes away the computation is dropped with it, and a
//! computation that panics gives up its slot so the next caller starts
//! fresh.
//!
//! Keys are plain strings; build them with [`cache_key`] so each compute
//! domain gets its own namespace prefix.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::Instant;

/// Free-form tags attached to an entry, e.g. `sensitive=true`.
pub type CacheMetadata = BTreeMap<String, String>;

/// Metadata tag marking an entry whose value holds secrets.
pub const SENSITIVE_TAG: &str = "sensitive";

/// Join a namespace and key parts with `:`.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut key = String::from(namespace);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// One stored result. Entries are replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub metadata: CacheMetadata,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn is_sensitive(&self) -> bool {
        self.metadata.get(SENSITIVE_TAG).map(String::as_str) == Some("true")
    }
}

type InFlight<V, E> = Shared<BoxFuture<'static, Result<V, Arc<E>>>>;

struct Slot<V, E> {
    id: u64,
    waiters: usize,
    future: InFlight<V, E>,
}

struct Inner<V, E> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    in_flight: Mutex<HashMap<String, Slot<V, E>>>,
    next_id: AtomicU64,
}

impl<V, E> Inner<V, E> {
    /// Remove the slot for `key` if it still belongs to computation `id`.
    fn release(&self, key: &str, id: u64) {
        let removed = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(slot) if slot.id == id => in_flight.remove(key),
                _ => None,
            }
        };
        // Dropping the future may run its own guard, which takes the lock.
        drop(removed);
    }

    /// One waiter of computation `id` is gone; the last one takes the slot
    /// with it.
    fn leave(&self, key: &str, id: u64) {
        let removed = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get_mut(key) {
                Some(slot) if slot.id == id => {
                    slot.waiters = slot.waiters.saturating_sub(1);
                    if slot.waiters == 0 {
                        tracing::debug!(key, "in-flight computation abandoned");
                        in_flight.remove(key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        drop(removed);
    }
}

/// Held by each caller awaiting a computation.
struct Waiter<'a, V, E> {
    inner: &'a Inner<V, E>,
    key: &'a str,
    id: u64,
}

impl<V, E> Drop for Waiter<'_, V, E> {
    fn drop(&mut self) {
        self.inner.leave(self.key, self.id);
    }
}

/// Owned by the computation itself; clears its slot on every exit path.
struct SlotGuard<V, E> {
    inner: Arc<Inner<V, E>>,
    key: String,
    id: u64,
}

impl<V, E> Drop for SlotGuard<V, E> {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.id);
    }
}

/// See the module docs. Cloning shares the underlying table.
pub struct CoalescingCache<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for CoalescingCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> Default for CoalescingCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> CoalescingCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        CoalescingCache {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Return the live value for `key`, or run `compute` at most once across
    /// concurrent callers and cache a success for `ttl`.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        metadata: CacheMetadata,
        compute: F,
    ) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if let Some(value) = self.get(key) {
            tracing::debug!(key, "cache hit");
            return Ok(value);
        }

        let (id, shared) = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(existing) = in_flight.get_mut(key) {
                tracing::debug!(key, "joining in-flight computation");
                existing.waiters += 1;
                (existing.id, existing.future.clone())
            } else {
                // A computation may have finished between the first check and
                // taking the in-flight lock; entries are written before the
                // in-flight slot is cleared.
                if let Some(value) = self.get(key) {
                    return Ok(value);
                }
                tracing::debug!(key, "cache miss, computing");
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let fut = self.computation(key.to_string(), id, ttl, metadata, compute());
                in_flight.insert(
                    key.to_string(),
                    Slot {
                        id,
                        waiters: 1,
                        future: fut.clone(),
                    },
                );
                (id, fut)
            }
        };

        let _waiter = Waiter {
            inner: &self.inner,
            key,
            id,
        };
        shared.await
    }

    fn computation<Fut>(
        &self,
        key: String,
        id: u64,
        ttl: Duration,
        metadata: CacheMetadata,
        fut: Fut,
    ) -> InFlight<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = self.inner.clone();
        async move {
            let slot = SlotGuard {
                inner: inner.clone(),
                key: key.clone(),
                id,
            };
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    tracing::error!(key = %key, "cache computation panicked");
                    drop(slot);
                    std::panic::resume_unwind(panic);
                }
            };
            if let Ok(value) = &result {
                let entry = CacheEntry {
                    value: value.clone(),
                    metadata,
                    expires_at: Instant::now() + ttl,
                };
                write(&inner.entries).insert(key, entry);
            }
            // Entries are written before the slot is cleared.
            drop(slot);
            result.map_err(Arc::new)
        }
        .boxed()
        .shared()
    }

    /// The live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        read(&self.inner.entries)
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Metadata of the live entry for `key`, if any.
    pub fn metadata(&self, key: &str) -> Option<CacheMetadata> {
        let now = Instant::now();
        read(&self.inner.entries)
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.metadata.clone())
    }

    /// Drop the entry for `key`. An in-flight computation is left running.
    pub fn invalidate(&self, key: &str) -> bool {
        write(&self.inner.entries).remove(key).is_some()
    }

    /// Drop every entry whose key starts with `prefix`; returns the count.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = write(&self.inner.entries);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Remove expired entries; returns the count.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = write(&self.inner.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of stored entries, live or not yet purged.
    pub fn len(&self) -> usize {
        read(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestCache = CoalescingCache<String, String>;

    fn sensitive() -> CacheMetadata {
        [(SENSITIVE_TAG.to_string(), "true".to_string())]
            .into_iter()
            .collect()
    }

    #[test]
    fn cache_key_joins_parts() {
        assert_eq!(
            cache_key("remote_snapshot", &["dev", "us-east-1", "/app/dev"]),
            "remote_snapshot:dev:us-east-1:/app/dev"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_computation() {
        let cache = TestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            gate.notified().await;
                            Ok("value".to_string())
                        }
                    })
                    .await
            }));
        }

        // Let every caller reach the in-flight future before releasing it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("value"), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_shared_but_not_cached() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>("boom".to_string()) }
            })
            .await;
        assert_eq!(first.unwrap_err().as_str(), "boom");
        assert!(cache.get("k").is_none());

        let second = cache
            .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>("ok".to_string()) }
            })
            .await;
        assert_eq!(second.expect("ok"), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_waiter_leaves_others_running() {
        let cache = TestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let spawn_caller = || {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            gate.notified().await;
                            Ok("value".to_string())
                        }
                    })
                    .await
            })
        };
        let first = spawn_caller();
        let second = spawn_caller();
        tokio::time::sleep(Duration::from_millis(50)).await;

        first.abort();
        assert!(first.await.expect_err("aborted").is_cancelled());
        gate.notify_one();

        assert_eq!(second.await.expect("join").expect("value"), "value");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_computation_is_not_reused() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                futures::future::pending::<Result<String, String>>()
            }),
        )
        .await;
        assert!(abandoned.is_err());

        let value = cache
            .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>("fresh".to_string()) }
            })
            .await
            .expect("fresh");
        assert_eq!(value, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    async fn explode() -> Result<String, String> {
        panic!("compute blew up")
    }

    #[tokio::test]
    async fn panicking_computation_frees_its_key() {
        let cache = TestCache::new();

        let crashed = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), explode)
                    .await
            })
        };
        assert!(crashed.await.expect_err("panicked").is_panic());

        let value = cache
            .get_or_compute("k", Duration::from_secs(60), CacheMetadata::new(), || async {
                Ok::<_, String>("recovered".to_string())
            })
            .await
            .expect("recovered");
        assert_eq!(value, "recovered");
        assert_eq!(cache.get("k").as_deref(), Some("recovered"));
    }

    async fn counted_fetch(cache: &TestCache, calls: &AtomicUsize) -> Result<String, Arc<String>> {
        cache
            .get_or_compute("k", Duration::from_secs(900), CacheMetadata::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(format!("v{n}")) }
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = TestCache::new();
        let calls = AtomicUsize::new(0);

        assert_eq!(counted_fetch(&cache, &calls).await.expect("v1"), "v1");
        tokio::time::advance(Duration::from_secs(899)).await;
        assert_eq!(counted_fetch(&cache, &calls).await.expect("still v1"), "v1");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counted_fetch(&cache, &calls).await.expect("v2"), "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn metadata_is_passed_through() {
        let cache = TestCache::new();
        cache
            .get_or_compute("secret", Duration::from_secs(60), sensitive(), || async {
                Ok::<_, String>("hunter2".to_string())
            })
            .await
            .expect("value");

        let meta = cache.metadata("secret").expect("metadata");
        assert_eq!(meta.get(SENSITIVE_TAG).map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn invalidate_prefix_only_touches_matching_keys() {
        let cache = TestCache::new();
        for key in ["remote_snapshot:dev", "remote_snapshot:prod", "other:dev"] {
            cache
                .get_or_compute(key, Duration::from_secs(60), CacheMetadata::new(), || async {
                    Ok::<_, String>("v".to_string())
                })
                .await
                .expect("value");
        }

        assert_eq!(cache.invalidate_prefix("remote_snapshot:"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("other:dev").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_drops_dead_entries() {
        let cache = TestCache::new();
        cache
            .get_or_compute("short", Duration::from_secs(1), CacheMetadata::new(), || async {
                Ok::<_, String>("a".to_string())
            })
            .await
            .expect("short");
        cache
            .get_or_compute("long", Duration::from_secs(100), CacheMetadata::new(), || async {
                Ok::<_, String>("b".to_string())
            })
            .await
            .expect("long");

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn entry_reports_sensitivity_from_metadata() {
        let entry = CacheEntry {
            value: 1,
            metadata: sensitive(),
            expires_at: Instant::now(),
        };
        assert!(entry.is_sensitive());
    }
}
