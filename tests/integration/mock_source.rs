//! Mock odds source for integration testing.
//!
//! Returns a fixed snapshot list after an optional delay, counts calls,
//! and can be switched into a failing mode. Fixtures are built relative
//! to the wall clock because quote staleness is judged against it.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use sharpline::bankroll::SharedBankroll;
use sharpline::cache::{CacheConfig, FetchCache, RetryPolicy};
use sharpline::engine::{OddsPayload, OpportunityTracker, TrackerConfig};
use sharpline::feed::{OddsRequest, OddsSource};
use sharpline::strategy::OpportunityPipeline;
use sharpline::types::*;

pub struct MockSource {
    snapshots: Mutex<Vec<MarketSnapshot>>,
    delay: Duration,
    calls: AtomicUsize,
    /// If set, every call fails with this error.
    force_error: Mutex<Option<SharplineError>>,
}

impl MockSource {
    pub fn new(snapshots: Vec<MarketSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            force_error: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_error(&self, error: Option<SharplineError>) {
        *self.force_error.lock().unwrap() = error;
    }

    pub fn set_snapshots(&self, snapshots: Vec<MarketSnapshot>) {
        *self.snapshots.lock().unwrap() = snapshots;
    }
}

#[async_trait]
impl OddsSource for MockSource {
    async fn fetch_odds(
        &self,
        _request: &OddsRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MarketSnapshot>, SharplineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => return Err(SharplineError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }
        if let Some(e) = self.force_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(self.snapshots.lock().unwrap().clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn network_error() -> SharplineError {
    SharplineError::Network {
        source_name: "mock".into(),
        message: "connection refused".into(),
    }
}

fn outcome(name: &str, price: i32, point: Option<f64>) -> Outcome {
    Outcome {
        name: name.to_string(),
        price,
        point,
        description: None,
    }
}

fn book(key: &str, markets: Vec<(MarketKey, Vec<Outcome>)>) -> BookmakerQuote {
    BookmakerQuote {
        key: key.to_string(),
        title: key.to_string(),
        last_update: Utc::now() - ChronoDuration::minutes(2),
        markets: markets
            .into_iter()
            .map(|(key, outcomes)| MarketLine {
                key,
                last_update: None,
                outcomes,
            })
            .collect(),
    }
}

/// NFL game with a moneyline arbitrage (Bills +150 / Chiefs -120) and a
/// one-point spread middle (Bills +4.5 / Chiefs -3.5).
pub fn arb_snapshot(id: &str) -> MarketSnapshot {
    MarketSnapshot {
        id: id.to_string(),
        sport_key: "americanfootball_nfl".into(),
        sport_title: "NFL".into(),
        commence_time: Utc::now() + ChronoDuration::hours(3),
        home_team: "Chiefs".into(),
        away_team: "Bills".into(),
        bookmakers: vec![
            book(
                "fanduel",
                vec![
                    (MarketKey::Moneyline, vec![outcome("Bills", 150, None), outcome("Chiefs", -180, None)]),
                    (
                        MarketKey::Spreads,
                        vec![outcome("Bills", -110, Some(4.5)), outcome("Chiefs", -110, Some(-4.5))],
                    ),
                ],
            ),
            book(
                "draftkings",
                vec![
                    (MarketKey::Moneyline, vec![outcome("Bills", 120, None), outcome("Chiefs", -120, None)]),
                    (
                        MarketKey::Spreads,
                        vec![outcome("Bills", -110, Some(3.5)), outcome("Chiefs", -110, Some(-3.5))],
                    ),
                ],
            ),
        ],
    }
}

/// Soccer match with a three-way moneyline (home/draw/away).
pub fn three_way_snapshot(id: &str) -> MarketSnapshot {
    MarketSnapshot {
        id: id.to_string(),
        sport_key: "soccer_epl".into(),
        sport_title: "EPL".into(),
        commence_time: Utc::now() + ChronoDuration::hours(5),
        home_team: "Arsenal".into(),
        away_team: "Chelsea".into(),
        bookmakers: vec![book(
            "williamhill",
            vec![(
                MarketKey::Moneyline,
                vec![
                    outcome("Arsenal", 110, None),
                    outcome("Chelsea", 250, None),
                    outcome("Draw", 240, None),
                ],
            )],
        )],
    }
}

pub fn make_request() -> OddsRequest {
    OddsRequest {
        sports: vec!["americanfootball_nfl".into(), "soccer_epl".into()],
        markets: vec![MarketKey::Moneyline, MarketKey::Spreads],
        regions: vec!["us".into()],
        bookmakers: vec![],
    }
}

pub fn make_cache() -> FetchCache<OddsPayload> {
    FetchCache::new(CacheConfig {
        default_ttl: Duration::from_secs(60),
        max_stale: Duration::from_secs(600),
        retry: RetryPolicy {
            max_retries: 1,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        },
    })
}

pub fn make_tracker(
    cache: &FetchCache<OddsPayload>,
    source: Arc<MockSource>,
    bankroll: Arc<SharedBankroll>,
) -> Arc<OpportunityTracker> {
    OpportunityTracker::new(
        cache.clone(),
        source,
        bankroll,
        OpportunityPipeline::default(),
        TrackerConfig {
            request: make_request(),
            opportunity: OpportunityConfig {
                min_profit_percent: 1.0,
                ..Default::default()
            },
            ttl: Duration::from_secs(60),
            max_stale: Duration::from_secs(600),
        },
    )
    .unwrap()
}
