//! Coalesced network loading on top of [`FetchCache`].
//!
//! At most one request per key is in flight. Concurrent callers attach to
//! it instead of issuing their own. A forced fetch starts a new request
//! generation and cancels the previous one; only the most recently
//! initiated generation may write its response into the cache, and
//! callers still waiting on an older generation are moved onto the newer
//! one.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CacheInner, Counters, FetchCache};
use crate::types::SharplineError;

type SharedLoad<T> = Shared<BoxFuture<'static, Result<T, SharplineError>>>;

pub(crate) struct InFlight<T> {
    generation: u64,
    shared: SharedLoad<T>,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Exponential backoff for retryable (network) failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Overrides the cache's default TTL.
    pub ttl: Option<Duration>,
    /// Overrides the cache's staleness bound for fallback reads.
    pub max_stale: Option<Duration>,
    /// Bypass fresh entries and supersede any in-flight request.
    pub force: bool,
}

impl FetchOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Loaded from the network by this call (or the request it joined).
    Fresh,
    /// Served from a cache entry within its TTL.
    Cached,
    /// Served from an entry past its TTL but inside the staleness bound.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub payload: T,
    pub freshness: Freshness,
    pub age: Duration,
    /// Set when a stale payload is served because the latest load failed.
    /// A background revalidation failure shows up on the next stale read.
    pub error: Option<SharplineError>,
}

impl<T> Fetched<T> {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

impl<T: Clone + Send + Sync + 'static> FetchCache<T> {
    /// Return the payload for `key`, loading it with `loader` when needed.
    ///
    /// * Fresh entry, not forced: served without touching the network.
    /// * Stale entry within bound, not forced: served immediately while a
    ///   revalidation runs in the background.
    /// * Otherwise the caller waits on the (possibly shared) request. If it
    ///   fails and a stale entry exists, that entry is returned together
    ///   with the error.
    pub async fn fetch<F, Fut>(
        &self,
        key: &str,
        loader: F,
        options: FetchOptions,
    ) -> Result<Fetched<T>, SharplineError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SharplineError>> + Send + 'static,
    {
        if self.inner.root.is_cancelled() {
            return self.fallback(key, &options, SharplineError::Cancelled);
        }

        let max_stale = options.max_stale.unwrap_or(self.inner.config.max_stale);
        let now = Instant::now();

        if !options.force {
            if let Some(entry) = self.entry(key) {
                if entry.is_fresh(now) {
                    Counters::bump(&self.inner.counters.hits);
                    debug!(key, "Cache hit");
                    return Ok(Fetched {
                        age: entry.age(now),
                        payload: entry.payload,
                        freshness: Freshness::Cached,
                        error: None,
                    });
                }
                if entry.is_usable(now, max_stale) {
                    Counters::bump(&self.inner.counters.stale_hits);
                    debug!(key, age_ms = entry.age(now).as_millis() as u64, "Serving stale entry, revalidating");
                    // Driver task owns the request; no need to await it here.
                    let _ = self.join_or_start(key, loader, &options);
                    return Ok(Fetched {
                        age: entry.age(now),
                        payload: entry.payload,
                        freshness: Freshness::Stale,
                        error: self.last_error(key),
                    });
                }
            }
            Counters::bump(&self.inner.counters.misses);
        }

        let mut shared = self.join_or_start(key, loader, &options);
        loop {
            match shared.await {
                Ok(payload) => {
                    return Ok(Fetched {
                        payload,
                        freshness: Freshness::Fresh,
                        age: Duration::ZERO,
                        error: None,
                    })
                }
                Err(SharplineError::Superseded | SharplineError::Cancelled)
                    if !self.inner.root.is_cancelled() =>
                {
                    match self.current_in_flight(key) {
                        Some(next) => {
                            debug!(key, "Request superseded, following newer request");
                            shared = next;
                        }
                        None => return self.fallback(key, &options, SharplineError::Superseded),
                    }
                }
                Err(e) => return self.fallback(key, &options, e),
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    fn current_in_flight(&self, key: &str) -> Option<SharedLoad<T>> {
        self.inner
            .state
            .lock()
            .in_flight
            .get(key)
            .map(|f| f.shared.clone())
    }

    fn fallback(
        &self,
        key: &str,
        options: &FetchOptions,
        error: SharplineError,
    ) -> Result<Fetched<T>, SharplineError> {
        let max_stale = options.max_stale.unwrap_or(self.inner.config.max_stale);
        let now = Instant::now();
        match self.entry(key).filter(|e| e.is_usable(now, max_stale)) {
            Some(entry) => {
                warn!(key, error = %error, "Fetch failed, serving stale entry");
                Ok(Fetched {
                    age: entry.age(now),
                    payload: entry.payload,
                    freshness: Freshness::Stale,
                    error: Some(error),
                })
            }
            None => Err(error),
        }
    }

    /// Attach to the key's in-flight request, or start one. A forced call
    /// always starts a new generation.
    fn join_or_start<F, Fut>(&self, key: &str, loader: F, options: &FetchOptions) -> SharedLoad<T>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SharplineError>> + Send + 'static,
    {
        let mut state = self.inner.state.lock();

        if !options.force {
            if let Some(existing) = state.in_flight.get(key) {
                Counters::bump(&self.inner.counters.coalesced);
                debug!(key, generation = existing.generation, "Joining in-flight request");
                return existing.shared.clone();
            }
        }

        let generation = {
            let g = state.generations.entry(key.to_string()).or_insert(0);
            *g += 1;
            *g
        };
        if let Some(previous) = state.in_flight.remove(key) {
            debug!(key, superseded = previous.generation, generation, "Superseding in-flight request");
            previous.cancel.cancel();
        }

        let cancel = self.inner.root.child_token();
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let load = run_load(
            Arc::downgrade(&self.inner),
            key.to_string(),
            generation,
            ttl,
            loader,
            cancel.clone(),
        );
        let shared = load.boxed().shared();

        state.in_flight.insert(
            key.to_string(),
            InFlight {
                generation,
                shared: shared.clone(),
                cancel,
            },
        );
        drop(state);

        // Drive the request independently of any caller so abandoned waits
        // still populate the cache.
        tokio::spawn(shared.clone());
        shared
    }
}

/// Perform one generation's load and publish it if still the latest.
async fn run_load<T, F, Fut>(
    inner: Weak<CacheInner<T>>,
    key: String,
    generation: u64,
    ttl: Duration,
    loader: F,
    cancel: CancellationToken,
) -> Result<T, SharplineError>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SharplineError>> + Send + 'static,
{
    let policy = match inner.upgrade() {
        Some(i) => i.config.retry.clone(),
        None => return Err(SharplineError::Cancelled),
    };

    let result = load_with_retry(&inner, &key, &loader, &cancel, &policy).await;

    let Some(inner) = inner.upgrade() else {
        return Err(SharplineError::Cancelled);
    };
    let is_latest = {
        let mut state = inner.state.lock();
        let latest = state.generations.get(&key) == Some(&generation);
        if latest {
            state.in_flight.remove(&key);
        }
        latest
    };

    match result {
        Ok(payload) if is_latest => {
            inner.set(&key, payload.clone(), ttl);
            Ok(payload)
        }
        Ok(_) => {
            debug!(key = %key, generation, "Discarding superseded response");
            Err(SharplineError::Superseded)
        }
        Err(e) if is_latest && e != SharplineError::Cancelled => {
            inner.record_failure(&key, e.clone());
            Err(e)
        }
        Err(e) => Err(e),
    }
}

async fn load_with_retry<T, F, Fut>(
    inner: &Weak<CacheInner<T>>,
    key: &str,
    loader: &F,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
) -> Result<T, SharplineError>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, SharplineError>>,
{
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            if let Some(i) = inner.upgrade() {
                Counters::bump(&i.counters.retries);
            }
            debug!(key, attempt, delay_ms = delay.as_millis() as u64, "Retrying fetch");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SharplineError::Cancelled),
                _ = sleep(delay) => {}
            }
        }

        if let Some(i) = inner.upgrade() {
            Counters::bump(&i.counters.network_calls);
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(SharplineError::Cancelled),
            r = loader(cancel.clone()) => r,
        };

        match result {
            Ok(payload) => return Ok(payload),
            Err(e) if e.is_retryable() => {
                warn!(key, attempt, error = %e, "Fetch attempt failed");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(SharplineError::Network {
        source_name: key.to_string(),
        message: "retries exhausted".into(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_cache() -> FetchCache<String> {
        FetchCache::new(CacheConfig {
            default_ttl: Duration::from_secs(60),
            max_stale: Duration::from_secs(600),
            retry: RetryPolicy {
                max_retries: 2,
                base_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
            },
        })
    }

    fn make_loader(
        calls: Arc<AtomicUsize>,
        delay: Duration,
        value: &'static str,
    ) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<String, SharplineError>> + Send + Sync + 'static
    {
        move |_cancel| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(delay).await;
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    fn network_error() -> SharplineError {
        SharplineError::Network {
            source_name: "test".into(),
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2000));
        assert_eq!(p.delay_for(4), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_request() {
        let cache = make_cache();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.fetch("k", make_loader(Arc::clone(&calls), Duration::from_millis(200), "v"), FetchOptions::default()),
            cache.fetch("k", make_loader(Arc::clone(&calls), Duration::from_millis(200), "v"), FetchOptions::default()),
        );

        assert_eq!(a.unwrap().payload, "v");
        assert_eq!(b.unwrap().payload, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 1);
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_skips_network() {
        let cache = make_cache();
        cache.set("k", "cached".into(), Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let got = cache
            .fetch("k", make_loader(Arc::clone(&calls), Duration::ZERO, "net"), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(got.payload, "cached");
        assert_eq!(got.freshness, Freshness::Cached);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_then_revalidated() {
        let cache = make_cache();
        cache.set("k", "old".into(), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let got = cache
            .fetch("k", make_loader(Arc::clone(&calls), Duration::from_millis(50), "new"), FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(got.payload, "old");
        assert!(got.is_stale());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k").as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let cache = make_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = move |_c: CancellationToken| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(network_error())
                } else {
                    Ok("third time".to_string())
                }
            }
        };

        let got = tokio_test::assert_ok!(cache.fetch("k", loader, FetchOptions::default()).await);
        assert_eq!(got.payload, "third time");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_without_stale_is_error() {
        let cache = make_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = move |_c: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<String, _>(network_error()) }
        };

        let result = cache.fetch("k", loader, FetchOptions::default()).await;
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, SharplineError::Network { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back_to_stale_with_error() {
        let cache = make_cache();
        cache.set("k", "last good".into(), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        let loader = |_c: CancellationToken| async { Err::<String, _>(network_error()) };
        let got = cache.fetch("k", loader, FetchOptions::forced()).await.unwrap();
        assert_eq!(got.payload, "last good");
        assert!(got.is_stale());
        assert!(matches!(got.error, Some(SharplineError::Network { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revalidation_reported_on_next_stale_read() {
        let cache = make_cache();
        let failures = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&failures);
        let _lease = cache.subscribe("k", move |event| {
            if let CacheEvent::Failed { .. } = event {
                sink.fetch_add(1, Ordering::SeqCst);
            }
        });
        cache.set("k", "last good".into(), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        let failing = |_c: CancellationToken| async { Err::<String, _>(network_error()) };
        let first = cache.fetch("k", failing, FetchOptions::default()).await.unwrap();
        assert!(first.is_stale());
        assert!(first.error.is_none());

        // background revalidation exhausts its retries
        sleep(Duration::from_secs(1)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.last_error("k"), Some(SharplineError::Network { .. })));

        let second = cache.fetch("k", failing, FetchOptions::default()).await.unwrap();
        assert_eq!(second.payload, "last good");
        assert!(matches!(second.error, Some(SharplineError::Network { .. })));

        // a successful write clears it
        sleep(Duration::from_secs(1)).await;
        cache.set("k", "new".into(), Duration::from_secs(1));
        assert!(cache.last_error("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_data_is_not_retried() {
        let cache = make_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = move |_c: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<String, _>(SharplineError::MalformedData {
                    context: "odds".into(),
                    message: "not json".into(),
                })
            }
        };

        let err = cache.fetch("k", loader, FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, SharplineError::MalformedData { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_fetch_supersedes_slower_request() {
        let cache = make_cache();
        let slow_calls = Arc::new(AtomicUsize::new(0));
        let fast_calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let loader = make_loader(Arc::clone(&slow_calls), Duration::from_millis(500), "old");
            tokio::spawn(async move { cache.fetch("k", loader, FetchOptions::forced()).await })
        };
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(10)).await;

        let second = cache
            .fetch("k", make_loader(Arc::clone(&fast_calls), Duration::from_millis(20), "new"), FetchOptions::forced())
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(second.payload, "new");
        assert_eq!(first.payload, "new");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").as_deref(), Some("new"));
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight() {
        let cache = make_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let cache = cache.clone();
            let loader = make_loader(Arc::clone(&calls), Duration::from_secs(30), "never");
            tokio::spawn(async move { cache.fetch("k", loader, FetchOptions::default()).await })
        };
        sleep(Duration::from_millis(10)).await;
        cache.shutdown();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, SharplineError::Cancelled);
        assert!(cache.get("k").is_none());
    }
}
