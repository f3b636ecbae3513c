//! Keyed read-through cache for backend queries.
//!
//! Each read is identified by a [`QueryKey`]. Values are fresh for
//! `stale_time`; a stale or invalidated value is refetched on the next read.
//! Entries nobody has read or watched for `gc_time` are dropped by
//! [`QueryCache::sweep`]. Concurrent reads of one key share a single fetch.
//! Mutations go through [`QueryCache::mutate`], which runs them exactly once
//! and invalidates the keys they declare.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Bounded retries with capped exponential backoff. Only errors the backend
/// may answer differently next time are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failure.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(60),
            gc_time: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, BackendError>> + Send + Sync>;

pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, _>)
}

struct Entry {
    value: Option<Value>,
    updated_at: Option<Instant>,
    invalidated: bool,
    /// Bumped by every invalidation; a fetch that started under an older
    /// generation may not mark the entry fresh.
    generation: u64,
    last_used: Instant,
    fetcher: Option<Fetcher>,
    tx: watch::Sender<Option<Value>>,
    inflight: Arc<Mutex<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            value: None,
            updated_at: None,
            invalidated: false,
            generation: 0,
            last_used: Instant::now(),
            fetcher: None,
            tx: watch::channel(None).0,
            inflight: Arc::new(Mutex::new(())),
        }
    }

    fn fresh_value(&self, stale_time: Duration) -> Option<Value> {
        let updated_at = self.updated_at?;
        if self.invalidated || updated_at.elapsed() >= stale_time {
            return None;
        }
        self.value.clone()
    }

    fn is_mounted(&self) -> bool {
        self.tx.receiver_count() > 0
    }
}

/// Live view of one key. While held, invalidating the key triggers a
/// background refetch whose result is pushed here.
pub struct Subscription {
    key: QueryKey,
    rx: watch::Receiver<Option<Value>>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// Waits for the next stored value. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<Value> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}

#[derive(Clone)]
pub struct QueryCache {
    config: CacheConfig,
    entries: Arc<Mutex<HashMap<QueryKey, Entry>>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cached value regardless of freshness.
    pub async fn peek(&self, key: &QueryKey) -> Option<Value> {
        let entries = self.entries.lock().await;
        entries.get(key).and_then(|e| e.value.clone())
    }

    pub async fn is_fresh(&self, key: &QueryKey) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .and_then(|e| e.fresh_value(self.config.stale_time))
            .is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn fetch(&self, key: QueryKey, fetcher: Fetcher) -> Result<Value, BackendError> {
        let inflight = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.last_used = Instant::now();
            entry.fetcher = Some(fetcher.clone());
            if let Some(value) = entry.fresh_value(self.config.stale_time) {
                debug!(%key, "cache hit");
                return Ok(value);
            }
            Arc::clone(&entry.inflight)
        };

        let _guard = inflight.lock_owned().await;

        // Whoever held the lock before us may have just filled the entry.
        let generation = {
            let entries = self.entries.lock().await;
            let entry = entries.get(&key);
            if let Some(value) = entry.and_then(|e| e.fresh_value(self.config.stale_time)) {
                debug!(%key, "cache hit after coalesced fetch");
                return Ok(value);
            }
            entry.map_or(0, |e| e.generation)
        };

        debug!(%key, generation, "cache miss, fetching");
        let value = self.fetch_with_retry(&key, &fetcher).await?;
        self.store(&key, value.clone(), generation).await;
        Ok(value)
    }

    pub async fn fetch_with<F, Fut>(&self, key: QueryKey, f: F) -> Result<Value, BackendError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BackendError>> + Send + 'static,
    {
        self.fetch(key, fetcher(f)).await
    }

    async fn fetch_with_retry(&self, key: &QueryKey, fetcher: &Fetcher) -> Result<Value, BackendError> {
        let policy = self.config.retry;
        let mut retry = 0;
        loop {
            match fetcher().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retry < policy.attempts => {
                    let delay = policy.delay_for(retry);
                    warn!(%key, error = %err, retry = retry + 1, ?delay, "fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stores a fetched value unless the key was invalidated since the fetch
    /// began; the refetch queued by that invalidation then does the work.
    async fn store(&self, key: &QueryKey, value: Value, generation: u64) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        if entry.generation != generation {
            debug!(%key, "invalidated while fetching, result not cached");
            return;
        }
        entry.value = Some(value.clone());
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        entry.tx.send_replace(Some(value));
    }

    pub async fn subscribe(&self, key: QueryKey, fetcher: Fetcher) -> Subscription {
        let (rx, needs_fetch) = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.last_used = Instant::now();
            entry.fetcher = Some(fetcher.clone());
            let needs_fetch = entry.fresh_value(self.config.stale_time).is_none();
            (entry.tx.subscribe(), needs_fetch)
        };

        if needs_fetch {
            self.spawn_fetch(key.clone(), fetcher);
        }
        Subscription { key, rx }
    }

    fn spawn_fetch(&self, key: QueryKey, fetcher: Fetcher) {
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.fetch(key.clone(), fetcher).await {
                warn!(%key, error = %err, "background refetch failed");
            }
        });
    }

    /// Marks every entry under `prefix` stale. Mounted entries are refetched
    /// in the background. Returns the number of entries touched.
    pub async fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut refetch = Vec::new();
        let touched = {
            let mut entries = self.entries.lock().await;
            let mut touched = 0;
            for (key, entry) in entries.iter_mut().filter(|(k, _)| k.starts_with(prefix)) {
                entry.invalidated = true;
                entry.generation = entry.generation.wrapping_add(1);
                touched += 1;
                if entry.is_mounted() {
                    if let Some(fetcher) = &entry.fetcher {
                        refetch.push((key.clone(), fetcher.clone()));
                    }
                }
            }
            touched
        };

        debug!(%prefix, touched, refetching = refetch.len(), "invalidated");
        for (key, fetcher) in refetch {
            self.spawn_fetch(key, fetcher);
        }
        touched
    }

    pub async fn invalidate_all(&self, prefixes: &[QueryKey]) -> usize {
        let mut touched = 0;
        for prefix in prefixes {
            touched += self.invalidate(prefix).await;
        }
        touched
    }

    /// Runs a mutation once. On success the declared keys are invalidated;
    /// on failure the error goes back to the caller and cached data stays.
    pub async fn mutate<Fut, T, E>(&self, invalidates: &[QueryKey], op: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let result = op.await;
        if result.is_ok() {
            self.invalidate_all(invalidates).await;
        }
        result
    }

    /// Drops entries that are unmounted and unused for longer than `gc_time`.
    pub async fn sweep(&self) -> usize {
        let gc_time = self.config.gc_time;
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.is_mounted() {
                entry.last_used = now;
                return true;
            }
            now.duration_since(entry.last_used) < gc_time
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "cache entries collected");
        }
        removed
    }

    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let period = (self.config.gc_time / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_fetcher(calls: Arc<AtomicU32>) -> Fetcher {
        fetcher(move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({ "version": n }))
            }
        })
    }

    fn key(parts: &[&str]) -> QueryKey {
        QueryKey::new(parts.iter().copied())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn prefix_matching() {
        let full = key(&["documents", "app-1", "page=2"]);
        assert!(full.starts_with(&key(&["documents"])));
        assert!(full.starts_with(&key(&["documents", "app-1"])));
        assert!(!full.starts_with(&key(&["documents", "app-2"])));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_values_are_served_from_cache() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let k = key(&["application", "app-1"]);

        let first = cache.fetch(k.clone(), counting_fetcher(calls.clone())).await.unwrap();
        let second = cache.fetch(k.clone(), counting_fetcher(calls.clone())).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let third = cache.fetch(k, counting_fetcher(calls.clone())).await.unwrap();
        assert_eq!(third, json!({ "version": 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_fetch() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let k = key(&["notifications", "admin-1"]);

        let (a, b, c) = tokio::join!(
            cache.fetch(k.clone(), counting_fetcher(calls.clone())),
            cache.fetch(k.clone(), counting_fetcher(calls.clone())),
            cache.fetch(k.clone(), counting_fetcher(calls.clone())),
        );
        assert_eq!(a.unwrap(), json!({ "version": 1 }));
        assert_eq!(b.unwrap(), json!({ "version": 1 }));
        assert_eq!(c.unwrap(), json!({ "version": 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_with_backoff() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let value = cache
            .fetch_with(key(&["applications"]), move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::Status { status: 503, message: "down".into() })
                    } else {
                        Ok(json!("ok"))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_and_exhausted_retries_surface() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = cache
            .fetch_with(key(&["application", "missing"]), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Status { status: 404, message: "not found".into() }) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not found");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        cache
            .fetch_with(key(&["applications"]), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Status { status: 500, message: "boom".into() }) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_refetches_mounted_keys() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let k = key(&["documents", "app-1"]);

        let mut sub = cache.subscribe(k.clone(), counting_fetcher(calls.clone())).await;
        assert_eq!(sub.changed().await, Some(json!({ "version": 1 })));

        let touched = cache.invalidate(&key(&["documents"])).await;
        assert_eq!(touched, 1);
        assert_eq!(sub.changed().await, Some(json!({ "version": 2 })));
        assert_eq!(sub.current(), Some(json!({ "version": 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_a_fetch_is_not_lost() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let k = key(&["documents", "app-1"]);

        let mut sub = cache.subscribe(k.clone(), counting_fetcher(calls.clone())).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The first fetch is still running and will return pre-mutation data.
        cache.invalidate(&key(&["documents"])).await;

        assert_eq!(sub.changed().await, Some(json!({ "version": 2 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_fresh(&k).await);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_of_unmounted_keys_defers_to_next_read() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let k = key(&["checklist", "app-1"]);

        cache.fetch(k.clone(), counting_fetcher(calls.clone())).await.unwrap();
        cache.invalidate(&k).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_fresh(&k).await);
        assert_eq!(cache.peek(&k).await, Some(json!({ "version": 1 })));

        let value = cache.fetch(k, counting_fetcher(calls.clone())).await.unwrap();
        assert_eq!(value, json!({ "version": 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_run_once_and_invalidate_only_on_success() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let k = key(&["notifications", "client-1"]);
        cache.fetch(k.clone(), counting_fetcher(calls.clone())).await.unwrap();

        let failed: Result<(), BackendError> = cache
            .mutate(&[k.clone()], async {
                Err(BackendError::Status { status: 503, message: "down".into() })
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_fresh(&k).await);

        let ok: Result<u8, BackendError> = cache.mutate(&[k.clone()], async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert!(!cache.is_fresh(&k).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_collects_only_unused_unmounted_entries() {
        let cache = QueryCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        cache.fetch(key(&["a"]), counting_fetcher(calls.clone())).await.unwrap();
        let sub = cache.subscribe(key(&["b"]), counting_fetcher(calls.clone())).await;

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 1);

        drop(sub);
        assert_eq!(cache.sweep().await, 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 0);
    }
}
