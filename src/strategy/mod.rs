//! Strategy engine: normalisation, arbitrage and middle detection, ranking.

pub mod arbitrage;
pub mod middle;
pub mod normalizer;
pub mod odds;
pub mod ranker;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::types::{
    ArbitrageOpportunity, MarketKey, MarketSnapshot, MiddleOpportunity, OpportunityConfig,
};
use arbitrage::{two_way_pairs, ArbRejection, ArbitrageDetector};
use middle::{HitProbabilityModel, LinearGapModel, MiddleDetector, DEFAULT_MIDDLE_BANKROLL_FRACTION};
use normalizer::{NormalizerConfig, OddsNormalizer};

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

/// Record of candidates passed on during a detection pass, and why.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionRecord {
    /// The whole pass was skipped; the report is empty.
    InvalidInput { reason: String },
    ArbRejected {
        event_id: String,
        market: MarketKey,
        reason: ArbRejection,
    },
    MiddlesRejected {
        event_id: String,
        market: MarketKey,
        count: usize,
    },
    DegenerateOutcomes {
        event_id: String,
        market: MarketKey,
        count: usize,
    },
}

/// Output of one detection generation.
#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub generation: u64,
    pub events_scanned: usize,
    /// Filtered and sorted per the config.
    pub arbitrage: Vec<ArbitrageOpportunity>,
    /// Filtered and sorted per the config.
    pub middles: Vec<MiddleOpportunity>,
    pub records: Vec<DetectionRecord>,
}

impl DetectionReport {
    fn invalid(generation: u64, reason: String) -> Self {
        Self {
            generation,
            records: vec![DetectionRecord::InvalidInput { reason }],
            ..Default::default()
        }
    }

    /// Reason the pass produced nothing, if it was skipped outright.
    pub fn failure(&self) -> Option<&str> {
        self.records.iter().find_map(|r| match r {
            DetectionRecord::InvalidInput { reason } => Some(reason.as_str()),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Detection parameters that are not user thresholds.
#[derive(Clone)]
pub struct DetectionSettings {
    pub normalizer: NormalizerConfig,
    /// Cap on middle stake as a share of bankroll.
    pub middle_bankroll_fraction: f64,
    pub hit_model: Arc<dyn HitProbabilityModel>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            middle_bankroll_fraction: DEFAULT_MIDDLE_BANKROLL_FRACTION,
            hit_model: Arc::new(LinearGapModel::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Pipelines normalisation → arbitrage/middle detection → filter/sort.
///
/// Pure with respect to its inputs: every call recomputes from scratch.
pub struct OpportunityPipeline {
    normalizer: OddsNormalizer,
    arbitrage: ArbitrageDetector,
    middles: MiddleDetector,
}

impl OpportunityPipeline {
    pub fn new(settings: DetectionSettings) -> Self {
        let window = settings.normalizer.max_quote_age;
        Self {
            arbitrage: ArbitrageDetector::new(window),
            middles: MiddleDetector::new(settings.hit_model, settings.middle_bankroll_fraction, window),
            normalizer: OddsNormalizer::new(settings.normalizer),
        }
    }

    /// Run the full detection pass over a set of snapshots.
    ///
    /// Never fails: an invalid configuration or bankroll yields an empty
    /// report carrying the reason.
    pub fn run(
        &self,
        snapshots: &[MarketSnapshot],
        config: &OpportunityConfig,
        bankroll: f64,
        now: DateTime<Utc>,
        generation: u64,
    ) -> DetectionReport {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Detection skipped: invalid configuration");
            return DetectionReport::invalid(generation, e.to_string());
        }
        if !bankroll.is_finite() || bankroll < 0.0 {
            warn!(bankroll, "Detection skipped: invalid bankroll");
            return DetectionReport::invalid(generation, format!("invalid bankroll {bankroll}"));
        }

        let mut report = DetectionReport {
            generation,
            ..Default::default()
        };
        let mut arbitrage = Vec::new();
        let mut middles = Vec::new();

        for snapshot in snapshots {
            if !config.allows_sport(&snapshot.sport_key) {
                continue;
            }
            report.events_scanned += 1;
            let started = snapshot.has_started(now);

            for market in Self::markets_in(snapshot) {
                if !config.allows_market(&market) {
                    continue;
                }
                let normalized = self.normalizer.normalize(snapshot, &market, &config.book_filter, now);
                if normalized.degenerate_outcomes > 0 {
                    report.records.push(DetectionRecord::DegenerateOutcomes {
                        event_id: snapshot.id.clone(),
                        market: market.clone(),
                        count: normalized.degenerate_outcomes,
                    });
                }
                if normalized.is_empty() {
                    continue;
                }

                if started {
                    report.records.push(DetectionRecord::ArbRejected {
                        event_id: snapshot.id.clone(),
                        market: market.clone(),
                        reason: ArbRejection::EventStarted,
                    });
                } else {
                    match two_way_pairs(&normalized) {
                        Ok(pairs) => {
                            for (first, second) in pairs {
                                match self.arbitrage.evaluate(
                                    &normalized.event,
                                    &market,
                                    &first,
                                    &second,
                                    config,
                                    bankroll,
                                    now,
                                    generation,
                                ) {
                                    Ok(arb) => arbitrage.push(arb),
                                    Err(reason) => {
                                        debug!(
                                            event_id = %snapshot.id,
                                            market = %market,
                                            reason = %reason,
                                            "Arbitrage candidate rejected"
                                        );
                                        report.records.push(DetectionRecord::ArbRejected {
                                            event_id: snapshot.id.clone(),
                                            market: market.clone(),
                                            reason,
                                        });
                                    }
                                }
                            }
                        }
                        Err(reason) => {
                            report.records.push(DetectionRecord::ArbRejected {
                                event_id: snapshot.id.clone(),
                                market: market.clone(),
                                reason,
                            });
                        }
                    }
                }

                let (found, rejected) = self.middles.detect(&normalized, config, bankroll, now, generation);
                middles.extend(found);
                if rejected > 0 {
                    report.records.push(DetectionRecord::MiddlesRejected {
                        event_id: snapshot.id.clone(),
                        market: market.clone(),
                        count: rejected,
                    });
                }
            }
        }

        report.arbitrage = ranker::rank(&arbitrage, config);
        report.middles = ranker::rank(&middles, config);

        info!(
            generation,
            events = report.events_scanned,
            arbitrage = report.arbitrage.len(),
            middles = report.middles.len(),
            rejected = report.records.len(),
            bankroll = format!("${:.2}", bankroll),
            "Detection pass complete"
        );

        report
    }

    /// Market keys quoted by any bookmaker, in first-seen order.
    fn markets_in(snapshot: &MarketSnapshot) -> Vec<MarketKey> {
        let mut seen = HashSet::new();
        snapshot
            .bookmakers
            .iter()
            .flat_map(|b| b.markets.iter().map(|m| m.key.clone()))
            .filter(|k| seen.insert(k.clone()))
            .collect()
    }
}

impl Default for OpportunityPipeline {
    fn default() -> Self {
        Self::new(DetectionSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
