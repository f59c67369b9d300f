//! Middle detection.
//!
//! A middle pairs two differing lines from two bookmakers, e.g. Over 44.5
//! at one book and Under 47.5 at another. If the result lands in the gap
//! both legs win; otherwise one leg wins and the position loses roughly
//! the vig. The hit probability is a pluggable heuristic, not a calibrated
//! model.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::arbitrage::{expires_in_ms, make_leg};
use super::normalizer::{BookPrice, NormalizedMarket, DEFAULT_MAX_QUOTE_AGE_MINS};
use super::odds::{floor_cents, implied_probability, round_cents};
use crate::types::{
    EventDescriptor, MarketKey, MarketKind, MiddleOpportunity, MiddleRange, OpportunityConfig,
};

/// Default share of bankroll a middle may consume.
pub const DEFAULT_MIDDLE_BANKROLL_FRACTION: f64 = 0.10;

// ---------------------------------------------------------------------------
// Hit probability
// ---------------------------------------------------------------------------

/// Estimates the chance that a result lands inside a middle's gap.
///
/// Implementations may use per-sport closing-line distributions; the
/// default is a bounded linear function of the gap.
pub trait HitProbabilityModel: Send + Sync {
    fn estimate(&self, sport_key: &str, kind: MarketKind, gap: f64) -> f64;

    fn name(&self) -> &str;
}

/// `min(cap, per_point × gap)`.
#[derive(Debug, Clone)]
pub struct LinearGapModel {
    pub per_point: f64,
    pub cap: f64,
}

impl Default for LinearGapModel {
    fn default() -> Self {
        Self {
            per_point: 0.05,
            cap: 0.45,
        }
    }
}

impl HitProbabilityModel for LinearGapModel {
    fn estimate(&self, _sport_key: &str, _kind: MarketKind, gap: f64) -> f64 {
        let p = self.per_point * gap;
        if p.is_finite() {
            p.clamp(0.0, self.cap)
        } else {
            0.0
        }
    }

    fn name(&self) -> &str {
        "linear-gap"
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MiddleRejection {
    NotLineMarket,
    SameBookmaker,
    /// Legs do not bracket a gap (exact opposites or reversed lines).
    NoGap { gap: f64 },
    GapBelowThreshold { gap: f64 },
    ProbabilityBelowThreshold { probability: f64 },
    StaleQuote { bookmaker: String },
    NoStakeBudget { budget: f64 },
}

impl fmt::Display for MiddleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddleRejection::NotLineMarket => write!(f, "not a spread/total market"),
            MiddleRejection::SameBookmaker => write!(f, "both legs at one bookmaker"),
            MiddleRejection::NoGap { gap } => write!(f, "no gap between lines ({gap})"),
            MiddleRejection::GapBelowThreshold { gap } => write!(f, "gap {gap} below threshold"),
            MiddleRejection::ProbabilityBelowThreshold { probability } => {
                write!(f, "hit probability {:.1}% below threshold", probability * 100.0)
            }
            MiddleRejection::StaleQuote { bookmaker } => write!(f, "stale quote at {bookmaker}"),
            MiddleRejection::NoStakeBudget { budget } => write!(f, "no stake budget (${budget:.2})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct MiddleDetector {
    model: Arc<dyn HitProbabilityModel>,
    /// Cap on total middle stake as a share of bankroll.
    bankroll_fraction: f64,
    quote_window: Duration,
}

/// Two legs oriented for evaluation plus the interval between them.
struct Candidate<'a> {
    first: &'a BookPrice,
    second: &'a BookPrice,
    gap: f64,
    range: MiddleRange,
}

impl MiddleDetector {
    pub fn new(model: Arc<dyn HitProbabilityModel>, bankroll_fraction: f64, quote_window: Duration) -> Self {
        Self {
            model,
            bankroll_fraction,
            quote_window,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Scan every cross-bookmaker pair of lines in a normalised market.
    ///
    /// Returns the accepted middles and the number of rejected candidates.
    pub fn detect(
        &self,
        market: &NormalizedMarket,
        config: &OpportunityConfig,
        bankroll: f64,
        now: DateTime<Utc>,
        generation: u64,
    ) -> (Vec<MiddleOpportunity>, usize) {
        let kind = market.market.kind();
        if !market.market.is_line_market() {
            return (Vec::new(), 0);
        }

        let quotes = distinct_quotes(&market.quotes);
        let mut found = Vec::new();
        let mut rejected = 0usize;

        for (i, a) in quotes.iter().enumerate() {
            for b in &quotes[i + 1..] {
                if a.bookmaker == b.bookmaker {
                    continue;
                }
                let Some(candidate) = orient(kind, a, b) else {
                    continue;
                };
                match self.evaluate_candidate(
                    &market.event,
                    &market.market,
                    candidate,
                    config,
                    bankroll,
                    now,
                    generation,
                ) {
                    Ok(middle) => found.push(middle),
                    Err(reason) => {
                        rejected += 1;
                        debug!(
                            event_id = %market.event.event_id,
                            market = %market.market,
                            first = %format!("{}@{}", a.selection(), a.bookmaker),
                            second = %format!("{}@{}", b.selection(), b.bookmaker),
                            reason = %reason,
                            "Middle candidate rejected"
                        );
                    }
                }
            }
        }

        (found, rejected)
    }

    /// Evaluate a single pair of quotes as a middle.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        event: &EventDescriptor,
        market: &MarketKey,
        a: &BookPrice,
        b: &BookPrice,
        config: &OpportunityConfig,
        bankroll: f64,
        now: DateTime<Utc>,
        generation: u64,
    ) -> Result<MiddleOpportunity, MiddleRejection> {
        if !market.is_line_market() {
            return Err(MiddleRejection::NotLineMarket);
        }
        if a.bookmaker == b.bookmaker {
            return Err(MiddleRejection::SameBookmaker);
        }
        let candidate = orient(market.kind(), a, b).ok_or(MiddleRejection::NoGap { gap: 0.0 })?;
        self.evaluate_candidate(event, market, candidate, config, bankroll, now, generation)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_candidate(
        &self,
        event: &EventDescriptor,
        market: &MarketKey,
        candidate: Candidate<'_>,
        config: &OpportunityConfig,
        bankroll: f64,
        now: DateTime<Utc>,
        generation: u64,
    ) -> Result<MiddleOpportunity, MiddleRejection> {
        let Candidate { first, second, gap, range } = candidate;

        if gap <= 0.0 {
            return Err(MiddleRejection::NoGap { gap });
        }
        if gap < config.min_middle_gap {
            return Err(MiddleRejection::GapBelowThreshold { gap });
        }
        for leg in [first, second] {
            if now - leg.last_update > self.quote_window {
                return Err(MiddleRejection::StaleQuote {
                    bookmaker: leg.bookmaker.clone(),
                });
            }
        }

        let probability = self.model.estimate(&event.sport_key, market.kind(), gap);
        if probability < config.min_middle_probability {
            return Err(MiddleRejection::ProbabilityBelowThreshold { probability });
        }

        let budget = config.max_stake.min(bankroll * self.bankroll_fraction);
        if !budget.is_finite() || budget <= 0.0 {
            return Err(MiddleRejection::NoStakeBudget { budget });
        }

        let stake = floor_cents(budget / 2.0);
        if stake <= 0.0 {
            return Err(MiddleRejection::NoStakeBudget { budget });
        }
        let total_stake = round_cents(stake * 2.0);
        let payout1 = round_cents(stake * first.decimal_odds);
        let payout2 = round_cents(stake * second.decimal_odds);

        let max_profit = round_cents(payout1 + payout2 - total_stake);
        let miss_profit = round_cents(payout1.min(payout2) - total_stake);
        let expected_value = round_cents(probability * max_profit + (1.0 - probability) * miss_profit);

        let id = format!(
            "mid:{generation}:{}:{}:{}@{}|{}@{}",
            event.event_id,
            market,
            first.selection(),
            first.bookmaker,
            second.selection(),
            second.bookmaker,
        );

        debug!(
            id = %id,
            gap,
            probability = format!("{:.1}%", probability * 100.0),
            max_profit = format!("${:.2}", max_profit),
            "Middle found"
        );

        Ok(MiddleOpportunity {
            id,
            event: event.clone(),
            market: market.clone(),
            gap,
            middle_range: range,
            win_probability: probability,
            legs: [
                make_leg(first, stake, payout1, implied_probability(first.decimal_odds)),
                make_leg(second, stake, payout2, implied_probability(second.decimal_odds)),
            ],
            total_stake,
            max_profit,
            miss_profit,
            expected_value,
            found_at: now,
            expires_in_ms: expires_in_ms(event, first, second, self.quote_window, now),
        })
    }
}

impl Default for MiddleDetector {
    fn default() -> Self {
        Self::new(
            Arc::new(LinearGapModel::default()),
            DEFAULT_MIDDLE_BANKROLL_FRACTION,
            Duration::minutes(DEFAULT_MAX_QUOTE_AGE_MINS),
        )
    }
}

/// Deduplicate (bookmaker, outcome, line, price) tuples, keeping input order.
fn distinct_quotes(quotes: &[BookPrice]) -> Vec<&BookPrice> {
    let mut seen = HashSet::new();
    quotes
        .iter()
        .filter(|q| {
            seen.insert((
                q.bookmaker.clone(),
                q.outcome_name.to_lowercase(),
                q.description.clone(),
                q.point.map(|p| (p + 0.0).to_bits()),
                q.price,
            ))
        })
        .collect()
}

/// Arrange two quotes as a middle, or `None` when they are not
/// complementary sides of the same proposition.
///
/// Totals: Over(lower) + Under(higher), gap = higher − lower.
/// Spreads: the side getting points first; gap = sum of both lines
/// (i.e. the distance once both are expressed from one team's view).
fn orient<'a>(kind: MarketKind, a: &'a BookPrice, b: &'a BookPrice) -> Option<Candidate<'a>> {
    let (pa, pb) = (a.point?, b.point?);
    match kind {
        MarketKind::Total | MarketKind::PlayerProp => {
            if a.description != b.description {
                return None;
            }
            let a_over = a.outcome_name.eq_ignore_ascii_case("over");
            let b_over = b.outcome_name.eq_ignore_ascii_case("over");
            let a_under = a.outcome_name.eq_ignore_ascii_case("under");
            let b_under = b.outcome_name.eq_ignore_ascii_case("under");
            let (over, under) = if a_over && b_under {
                (a, b)
            } else if a_under && b_over {
                (b, a)
            } else {
                return None;
            };
            let (low, high) = (over.point?, under.point?);
            Some(Candidate {
                first: over,
                second: under,
                gap: high - low,
                range: MiddleRange { low, high },
            })
        }
        MarketKind::Spread => {
            if a.outcome_name.eq_ignore_ascii_case(&b.outcome_name) {
                return None;
            }
            let (dog, fav, dog_line, fav_line) = if pa >= pb { (a, b, pa, pb) } else { (b, a, pb, pa) };
            Some(Candidate {
                first: dog,
                second: fav,
                gap: dog_line + fav_line,
                range: MiddleRange {
                    low: -fav_line,
                    high: dog_line,
                },
            })
        }
        MarketKind::Moneyline | MarketKind::Other => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
