//! Fetch cache.
//!
//! A TTL-keyed payload store shared by every consumer in the process.
//! Entries are fresh while younger than their TTL and remain usable as
//! stale fallbacks up to a wider bound, which is what lets consumers
//! render cached data immediately while a refresh runs in the background.
//!
//! Writes (`set`, `delete`) and failed loads notify the key's subscribers
//! synchronously before returning. Network loading, request coalescing and retry live
//! in [`fetch`].

pub mod fetch;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::SharplineError;
pub use fetch::{FetchOptions, Fetched, Freshness, RetryPolicy};
use fetch::InFlight;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used by `fetch` when the caller does not pass one.
    pub default_ttl: Duration,
    /// How long past `fetched_at` an entry may still be served as stale.
    pub max_stale: Duration,
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            max_stale: Duration::from_secs(10 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub fetched_at: Instant,
    pub ttl: Duration,
    /// Staleness bound: never served past this age.
    pub stale_for: Duration,
}

impl<T> CacheEntry<T> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.fetched_at)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }

    pub fn is_usable(&self, now: Instant, max_stale: Duration) -> bool {
        self.age(now) < max_stale
    }
}

/// Change notification delivered to a key's subscribers.
#[derive(Debug, Clone)]
pub enum CacheEvent<T> {
    Updated { key: String, payload: T },
    Deleted { key: String },
    /// The latest load for `key` failed. Any cached entry is unchanged.
    Failed { key: String, error: SharplineError },
}

pub type Callback<T> = Arc<dyn Fn(&CacheEvent<T>) + Send + Sync>;

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub network_calls: u64,
    pub retries: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) stale_hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) network_calls: AtomicU64,
    pub(crate) retries: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub(crate) struct CacheState<T> {
    pub(crate) entries: HashMap<String, CacheEntry<T>>,
    pub(crate) in_flight: HashMap<String, InFlight<T>>,
    /// Last initiated request generation per key.
    pub(crate) generations: HashMap<String, u64>,
    /// Error from the latest failed load, cleared by the next write.
    pub(crate) last_errors: HashMap<String, SharplineError>,
    subscribers: HashMap<String, Vec<(u64, Callback<T>)>>,
    next_subscriber: u64,
}

pub(crate) struct CacheInner<T> {
    pub(crate) state: Mutex<CacheState<T>>,
    pub(crate) config: CacheConfig,
    /// Parent of every in-flight request token.
    pub(crate) root: CancellationToken,
    pub(crate) counters: Counters,
}

/// Process-wide cache handle. Cloning shares the same store.
pub struct FetchCache<T> {
    pub(crate) inner: Arc<CacheInner<T>>,
}

impl<T> Clone for FetchCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FetchCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    generations: HashMap::new(),
                    last_errors: HashMap::new(),
                    subscribers: HashMap::new(),
                    next_subscriber: 0,
                }),
                config,
                root: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Payload if still within its TTL.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|e| e.is_fresh(now))
            .map(|e| e.payload.clone())
    }

    /// Payload if younger than `max_stale`, even past its TTL.
    pub fn get_with_stale_fallback(&self, key: &str, max_stale: Duration) -> Option<T> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|e| e.is_usable(now, max_stale))
            .map(|e| e.payload.clone())
    }

    /// Entry with its metadata, regardless of age.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.inner.state.lock().entries.get(key).cloned()
    }

    /// Error from the most recent failed load of `key`, if no write has
    /// succeeded since.
    pub fn last_error(&self, key: &str) -> Option<SharplineError> {
        self.inner.state.lock().last_errors.get(key).cloned()
    }

    /// Overwrite `key` and notify its subscribers before returning.
    pub fn set(&self, key: &str, payload: T, ttl: Duration) {
        self.inner.set(key, payload, ttl);
    }

    /// Remove `key`. Returns whether an entry existed.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.delete(key)
    }

    /// Delete every key starting with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        };
        keys.iter().filter(|k| self.inner.delete(k)).count()
    }

    /// Drop entries past their staleness bound. Silent: nothing usable
    /// was lost, so subscribers are not notified.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.is_usable(now, e.stale_for));
        let evicted = before - state.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.entries.len(), "Evicted expired cache entries");
        }
        evicted
    }

    /// Register a callback for changes to `key`.
    ///
    /// The returned lease unsubscribes when dropped.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription<T>
    where
        F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            key: key.to_string(),
            id,
            cache: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .state
            .lock()
            .subscribers
            .get(key)
            .map_or(0, |s| s.len())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            network_calls: c.network_calls.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
        }
    }

    /// Cancel every in-flight request. Cached entries stay readable.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }
}

impl<T: Clone> CacheInner<T> {
    pub(crate) fn set(&self, key: &str, payload: T, ttl: Duration) {
        let callbacks = {
            let mut state = self.state.lock();
            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    payload: payload.clone(),
                    fetched_at: Instant::now(),
                    ttl,
                    stale_for: self.config.max_stale.max(ttl),
                },
            );
            state.last_errors.remove(key);
            Self::callbacks_for(&state, key)
        };

        let event = CacheEvent::Updated {
            key: key.to_string(),
            payload,
        };
        for cb in callbacks {
            cb(&event);
        }
    }

    pub(crate) fn delete(&self, key: &str) -> bool {
        let (existed, callbacks) = {
            let mut state = self.state.lock();
            let existed = state.entries.remove(key).is_some();
            state.last_errors.remove(key);
            (existed, Self::callbacks_for(&state, key))
        };

        if existed {
            let event = CacheEvent::Deleted { key: key.to_string() };
            for cb in callbacks {
                cb(&event);
            }
        }
        existed
    }

    /// Remember a failed load and tell the key's subscribers.
    pub(crate) fn record_failure(&self, key: &str, error: SharplineError) {
        let callbacks = {
            let mut state = self.state.lock();
            state.last_errors.insert(key.to_string(), error.clone());
            Self::callbacks_for(&state, key)
        };

        let event = CacheEvent::Failed {
            key: key.to_string(),
            error,
        };
        for cb in callbacks {
            cb(&event);
        }
    }

    /// Callbacks are invoked after the lock is released so they may call
    /// back into the cache.
    fn callbacks_for(state: &CacheState<T>, key: &str) -> Vec<Callback<T>> {
        state
            .subscribers
            .get(key)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(subs) = state.subscribers.get_mut(key) {
            subs.retain(|(sid, _)| *sid != id);
            if subs.is_empty() {
                state.subscribers.remove(key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription lease
// ---------------------------------------------------------------------------

/// Unsubscribes from its cache key when dropped.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription<T: Clone> {
    key: String,
    id: u64,
    cache: Weak<CacheInner<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease explicitly.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            inner.unsubscribe(&self.key, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Derive a cache key from an endpoint and its query parameters.
///
/// Parameters are sorted so that ordering does not produce distinct keys.
pub fn generate_key(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort();
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{url}?{query}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
