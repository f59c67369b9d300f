//! Opportunity tracker.
//!
//! The consumer-facing handle: owns one odds request, keeps its ranked
//! arbitrage and middle lists current, and publishes them with
//! loading/error/staleness metadata over a watch channel.
//!
//! Lists are recomputed whenever the cached payload changes (including
//! refreshes issued by other consumers of the same cache key), the
//! bankroll changes, or the opportunity config is replaced. After
//! `shutdown` nothing is published.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::{HostEnvironment, PollingConfig, PollingScheduler, PollingState, RefreshTarget};
use crate::bankroll::BankrollProvider;
use crate::cache::{CacheEvent, FetchCache, FetchOptions, Subscription};
use crate::feed::{OddsRequest, OddsSource};
use crate::strategy::{DetectionRecord, OpportunityPipeline};
use crate::types::{
    ArbitrageOpportunity, MarketSnapshot, MiddleOpportunity, OpportunityConfig, SharplineError,
};

/// Cached feed payload. Shared so cache reads never copy the snapshot list.
pub type OddsPayload = Arc<Vec<MarketSnapshot>>;

// ---------------------------------------------------------------------------
// Published state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TrackerState {
    pub arbitrage: Vec<ArbitrageOpportunity>,
    pub middles: Vec<MiddleOpportunity>,
    pub loading: bool,
    /// Last fetch or configuration error. Lists keep their previous values.
    pub error: Option<SharplineError>,
    /// Lists were computed from a payload past its TTL.
    pub stale: bool,
    /// When the payload behind the lists was received.
    pub last_updated: Option<DateTime<Utc>>,
    pub generation: u64,
    pub events_scanned: usize,
    pub diagnostics: Vec<DetectionRecord>,
}

impl TrackerState {
    pub fn opportunity_count(&self) -> usize {
        self.arbitrage.len() + self.middles.len()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub request: OddsRequest,
    pub opportunity: OpportunityConfig,
    pub ttl: Duration,
    pub max_stale: Duration,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct OpportunityTracker {
    cache: FetchCache<OddsPayload>,
    source: Arc<dyn OddsSource>,
    bankroll: Arc<dyn BankrollProvider>,
    pipeline: OpportunityPipeline,
    request: OddsRequest,
    cache_key: String,
    ttl: Duration,
    max_stale: Duration,
    config: RwLock<OpportunityConfig>,
    state: watch::Sender<TrackerState>,
    /// Payload the current lists were computed from.
    last_payload: Mutex<Option<OddsPayload>>,
    generation: AtomicU64,
    /// Token of the newest refresh; a new refresh cancels its predecessor.
    current: Mutex<CancellationToken>,
    disposed: CancellationToken,
    subscription: Mutex<Option<Subscription<OddsPayload>>>,
    scheduler: Mutex<Option<PollingScheduler>>,
}

impl OpportunityTracker {
    /// Build a tracker and hook it to the cache and bankroll.
    ///
    /// Must be called inside a tokio runtime (spawns the bankroll watcher).
    pub fn new(
        cache: FetchCache<OddsPayload>,
        source: Arc<dyn OddsSource>,
        bankroll: Arc<dyn BankrollProvider>,
        pipeline: OpportunityPipeline,
        config: TrackerConfig,
    ) -> Result<Arc<Self>, SharplineError> {
        config.opportunity.validate()?;

        let cache_key = config.request.cache_key(source.name());
        let disposed = CancellationToken::new();
        let (state, _rx) = watch::channel(TrackerState::default());

        let tracker = Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_change = weak.clone();
            let subscription = cache.subscribe(&cache_key, move |event| {
                if let Some(tracker) = on_change.upgrade() {
                    tracker.on_cache_event(event);
                }
            });

            Self {
                cache,
                source,
                bankroll,
                pipeline,
                request: config.request,
                cache_key,
                ttl: config.ttl,
                max_stale: config.max_stale,
                config: RwLock::new(config.opportunity),
                state,
                last_payload: Mutex::new(None),
                generation: AtomicU64::new(0),
                current: Mutex::new(disposed.child_token()),
                disposed,
                subscription: Mutex::new(Some(subscription)),
                scheduler: Mutex::new(None),
            }
        });

        tokio::spawn(watch_bankroll(
            Arc::downgrade(&tracker),
            tracker.bankroll.watch(),
            tracker.disposed.clone(),
        ));

        info!(key = %tracker.cache_key, "Opportunity tracker ready");
        Ok(tracker)
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> TrackerState {
        self.state.borrow().clone()
    }

    pub fn config(&self) -> OpportunityConfig {
        self.config.read().clone()
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Load (or reuse) the feed payload and recompute the lists.
    ///
    /// A newer call supersedes this one: the older call returns without
    /// publishing anything.
    pub async fn refresh(&self, force: bool) {
        if self.is_disposed() {
            return;
        }

        let token = {
            let mut current = self.current.lock();
            current.cancel();
            *current = self.disposed.child_token();
            current.clone()
        };
        self.state.send_if_modified(|s| !std::mem::replace(&mut s.loading, true));

        let source = Arc::clone(&self.source);
        let request = self.request.clone();
        let loader = move |cancel: CancellationToken| {
            let source = Arc::clone(&source);
            let request = request.clone();
            async move { source.fetch_odds(&request, &cancel).await.map(Arc::new) }
        };
        let options = FetchOptions {
            ttl: Some(self.ttl),
            max_stale: Some(self.max_stale),
            force,
        };

        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(key = %self.cache_key, "Refresh superseded or disposed");
                return;
            }
            r = self.cache.fetch(&self.cache_key, loader, options) => r,
        };

        match result {
            Ok(fetched) => {
                if let Some(e) = &fetched.error {
                    warn!(key = %self.cache_key, error = %e, "Showing stale odds after failed refresh");
                }
                let stale = fetched.is_stale();
                self.apply(fetched.payload, stale, fetched.error, fetched.age);
            }
            Err(e) => {
                warn!(key = %self.cache_key, error = %e, "Odds refresh failed");
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(e);
                });
            }
        }
    }

    /// Replace the opportunity config. An invalid config is rejected and
    /// the previous one stays in effect.
    pub fn update_config(&self, config: OpportunityConfig) -> Result<(), SharplineError> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected opportunity config");
            self.state.send_modify(|s| s.error = Some(e.clone()));
            return Err(e);
        }
        *self.config.write() = config;
        self.state.send_modify(|s| {
            if matches!(s.error, Some(SharplineError::Configuration(_))) {
                s.error = None;
            }
        });
        self.recompute_last();
        Ok(())
    }

    /// Start interval polling against `host`. Returns false if already polling.
    pub fn start_polling(
        self: &Arc<Self>,
        host: Arc<dyn HostEnvironment>,
        config: PollingConfig,
    ) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut scheduler = self.scheduler.lock();
        if let Some(existing) = scheduler.as_ref() {
            if existing.is_running() {
                return false;
            }
        }
        let this: Arc<dyn RefreshTarget> = self.clone();
        let poller = PollingScheduler::new(Arc::downgrade(&this), host, config);
        let started = poller.start();
        *scheduler = Some(poller);
        started
    }

    pub fn stop_polling(&self) {
        if let Some(poller) = self.scheduler.lock().take() {
            poller.stop();
        }
    }

    pub fn polling_state(&self) -> PollingState {
        self.scheduler
            .lock()
            .as_ref()
            .map_or(PollingState::Idle, |p| p.state())
    }

    /// Stop polling, abandon in-flight refreshes and detach from the cache.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.disposed.is_cancelled() {
            return;
        }
        self.disposed.cancel();
        self.stop_polling();
        self.subscription.lock().take();
        self.state.send_modify(|s| s.loading = false);
        info!(key = %self.cache_key, "Opportunity tracker shut down");
    }

    // -- Recompute -------------------------------------------------------

    fn on_cache_event(&self, event: &CacheEvent<OddsPayload>) {
        match event {
            CacheEvent::Updated { payload, .. } => {
                debug!(key = %self.cache_key, events = payload.len(), "Cache updated");
                self.apply(Arc::clone(payload), false, None, Duration::ZERO);
            }
            CacheEvent::Deleted { .. } => {
                self.state.send_if_modified(|s| !std::mem::replace(&mut s.stale, true));
            }
            CacheEvent::Failed { error, .. } => {
                if self.is_disposed() {
                    return;
                }
                warn!(key = %self.cache_key, error = %error, "Odds load failed");
                let has_payload = self.last_payload.lock().is_some();
                self.state.send_modify(|s| {
                    s.error = Some(error.clone());
                    s.stale |= has_payload;
                });
            }
        }
    }

    /// Publish lists for `payload`, which was received `age` ago. The
    /// pipeline only reruns when the payload differs from the one already
    /// shown.
    fn apply(&self, payload: OddsPayload, stale: bool, error: Option<SharplineError>, age: Duration) {
        if self.is_disposed() {
            return;
        }

        let unchanged = self
            .last_payload
            .lock()
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &payload));
        if unchanged {
            self.state.send_modify(|s| {
                s.loading = false;
                s.stale = stale;
                s.error = error;
            });
            return;
        }

        *self.last_payload.lock() = Some(Arc::clone(&payload));
        let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        self.compute(&payload, stale, error, Some(Utc::now() - age));
    }

    fn recompute_last(&self) {
        if self.is_disposed() {
            return;
        }
        let payload = self.last_payload.lock().clone();
        if let Some(payload) = payload {
            let (stale, error) = {
                let s = self.state.borrow();
                (s.stale, s.error.clone())
            };
            self.compute(&payload, stale, error, None);
        }
    }

    fn compute(
        &self,
        payload: &OddsPayload,
        stale: bool,
        error: Option<SharplineError>,
        received_at: Option<DateTime<Utc>>,
    ) {
        let config = self.config.read().clone();
        let bankroll = self.bankroll.bankroll();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let report = self
            .pipeline
            .run(payload, &config, bankroll, Utc::now(), generation);

        let error = error.or_else(|| report.failure().map(|r| SharplineError::Configuration(r.to_string())));

        self.state.send_modify(|s| {
            s.arbitrage = report.arbitrage;
            s.middles = report.middles;
            s.diagnostics = report.records;
            s.events_scanned = report.events_scanned;
            s.generation = generation;
            s.loading = false;
            s.stale = stale;
            s.error = error;
            if received_at.is_some() {
                s.last_updated = received_at;
            }
        });
    }
}

#[async_trait]
impl RefreshTarget for OpportunityTracker {
    async fn refresh(&self, force: bool) {
        OpportunityTracker::refresh(self, force).await;
    }
}

impl Drop for OpportunityTracker {
    fn drop(&mut self) {
        self.disposed.cancel();
    }
}

async fn watch_bankroll(
    tracker: Weak<OpportunityTracker>,
    mut rx: watch::Receiver<f64>,
    disposed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = disposed.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let amount = *rx.borrow_and_update();
                let Some(tracker) = tracker.upgrade() else { break };
                debug!(bankroll = amount, "Bankroll changed, recomputing");
                tracker.recompute_last();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
