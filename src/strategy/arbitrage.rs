//! Two-leg arbitrage detection.
//!
//! Pairs the best price on each side of a two-way market and reports a
//! stake split that returns the same payout whichever side wins, provided
//! the combined implied probability is below 100%.
//!
//! Spread and total legs must be exact mathematical opposites (+3.5/-3.5,
//! Over 45.5/Under 45.5). Pairs with a gap between lines are middles, not
//! arbitrage, and are left to the middle detector.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use tracing::debug;

use super::normalizer::{BookPrice, NormalizedMarket};
use super::odds::{implied_probability, round_cents, split_stake};
use crate::types::{
    ArbitrageOpportunity, EventDescriptor, MarketKey, MarketKind, OpportunityConfig,
    OpportunityLeg,
};

/// Tolerance for comparing line values.
const LINE_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why a candidate pair did not become an opportunity.
#[derive(Debug, Clone, PartialEq)]
pub enum ArbRejection {
    /// Game in progress or completed.
    EventStarted,
    /// More than two mutually exclusive outcomes (e.g. soccer 1X2).
    MultiOutcome { outcomes: usize },
    SameBookmaker { bookmaker: String },
    SameOutcome,
    /// Lines are not exact opposites; the pair may still be a middle.
    LinesNotOpposite {
        first: Option<f64>,
        second: Option<f64>,
    },
    NoEdge { total_implied_probability: f64 },
    BelowThreshold { profit_percent: f64 },
    NoStakeBudget { effective_max_stake: f64 },
    Degenerate(String),
}

impl fmt::Display for ArbRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArbRejection::EventStarted => write!(f, "event already started"),
            ArbRejection::MultiOutcome { outcomes } => {
                write!(f, "{outcomes}-way market not supported")
            }
            ArbRejection::SameBookmaker { bookmaker } => {
                write!(f, "both best prices at {bookmaker}")
            }
            ArbRejection::SameOutcome => write!(f, "legs cover the same outcome"),
            ArbRejection::LinesNotOpposite { first, second } => {
                write!(f, "lines not opposite ({first:?} vs {second:?})")
            }
            ArbRejection::NoEdge { total_implied_probability } => write!(
                f,
                "implied probability {:.2}% >= 100%",
                total_implied_probability * 100.0
            ),
            ArbRejection::BelowThreshold { profit_percent } => {
                write!(f, "profit {profit_percent:.2}% below threshold")
            }
            ArbRejection::NoStakeBudget { effective_max_stake } => {
                write!(f, "no stake budget (${effective_max_stake:.2})")
            }
            ArbRejection::Degenerate(msg) => write!(f, "degenerate arithmetic: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

fn same_point(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() < LINE_EPSILON,
        (None, None) => true,
        _ => false,
    }
}

fn opposite_point(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a + b).abs() < LINE_EPSILON,
        _ => false,
    }
}

fn is_over(p: &BookPrice) -> bool {
    p.outcome_name.eq_ignore_ascii_case("over")
}

fn is_under(p: &BookPrice) -> bool {
    p.outcome_name.eq_ignore_ascii_case("under")
}

/// Whether two prices cover complementary sides of the same proposition.
pub fn are_exact_opposites(kind: MarketKind, a: &BookPrice, b: &BookPrice) -> bool {
    if a.outcome_name.eq_ignore_ascii_case(&b.outcome_name) {
        return false;
    }
    match kind {
        MarketKind::Spread => opposite_point(a.point, b.point),
        MarketKind::Total | MarketKind::PlayerProp => {
            ((is_over(a) && is_under(b)) || (is_under(a) && is_over(b)))
                && a.description == b.description
                && a.point.is_some()
                && same_point(a.point, b.point)
        }
        MarketKind::Moneyline | MarketKind::Other => same_point(a.point, b.point),
    }
}

/// Form the two-way pairs of best prices that arbitrage can be checked on.
///
/// Moneyline-style markets must have exactly two outcomes. Line markets
/// yield one pair per line that is quoted on both sides.
pub fn two_way_pairs(market: &NormalizedMarket) -> Result<Vec<(BookPrice, BookPrice)>, ArbRejection> {
    let kind = market.market.kind();
    let best = &market.best;

    if !market.market.is_line_market() {
        return match best.len() {
            0 | 1 => Ok(Vec::new()),
            2 => Ok(vec![(best[0].clone(), best[1].clone())]),
            n => Err(ArbRejection::MultiOutcome { outcomes: n }),
        };
    }

    let mut pairs = Vec::new();
    for (i, a) in best.iter().enumerate() {
        for b in &best[i + 1..] {
            if are_exact_opposites(kind, a, b) {
                pairs.push((a.clone(), b.clone()));
            }
        }
    }
    Ok(pairs)
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct ArbitrageDetector {
    /// Staleness window used to compute how long an opportunity stays valid.
    quote_window: Duration,
}

impl ArbitrageDetector {
    pub fn new(quote_window: Duration) -> Self {
        Self { quote_window }
    }

    /// Evaluate one candidate pair.
    ///
    /// Stakes are split in proportion to each leg's share of the combined
    /// implied probability, so both payouts are (almost) equal. The stake
    /// budget is `min(config.max_stake, bankroll)`.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        event: &EventDescriptor,
        market: &MarketKey,
        first: &BookPrice,
        second: &BookPrice,
        config: &OpportunityConfig,
        bankroll: f64,
        now: DateTime<Utc>,
        generation: u64,
    ) -> Result<ArbitrageOpportunity, ArbRejection> {
        if event.commence_time <= now {
            return Err(ArbRejection::EventStarted);
        }
        if first.outcome_name.eq_ignore_ascii_case(&second.outcome_name)
            && first.description == second.description
        {
            return Err(ArbRejection::SameOutcome);
        }
        if !are_exact_opposites(market.kind(), first, second) {
            return Err(ArbRejection::LinesNotOpposite {
                first: first.point,
                second: second.point,
            });
        }
        if first.bookmaker == second.bookmaker {
            return Err(ArbRejection::SameBookmaker {
                bookmaker: first.bookmaker.clone(),
            });
        }

        let (d1, d2) = (first.decimal_odds, second.decimal_odds);
        if !(d1.is_finite() && d2.is_finite() && d1 > 1.0 && d2 > 1.0) {
            return Err(ArbRejection::Degenerate(format!("decimal odds {d1} / {d2}")));
        }

        let p1 = implied_probability(d1);
        let p2 = implied_probability(d2);
        let total_implied = p1 + p2;

        if total_implied >= 1.0 {
            return Err(ArbRejection::NoEdge {
                total_implied_probability: total_implied,
            });
        }

        let effective_max_stake = config.max_stake.min(bankroll);
        if !effective_max_stake.is_finite() || effective_max_stake <= 0.0 {
            return Err(ArbRejection::NoStakeBudget { effective_max_stake });
        }

        let (stake1, stake2) = split_stake(effective_max_stake, p1 / total_implied);
        let total_stake = round_cents(stake1 + stake2);
        if total_stake <= 0.0 {
            return Err(ArbRejection::NoStakeBudget { effective_max_stake });
        }

        let payout1 = round_cents(stake1 * d1);
        let payout2 = round_cents(stake2 * d2);
        let guaranteed_profit = round_cents(payout1.min(payout2) - total_stake);
        let profit_percent = guaranteed_profit / total_stake * 100.0;

        if profit_percent < config.min_profit_percent {
            return Err(ArbRejection::BelowThreshold { profit_percent });
        }

        let expires_in_ms = expires_in_ms(event, first, second, self.quote_window, now);
        let id = format!(
            "arb:{generation}:{}:{}:{}@{}|{}@{}",
            event.event_id,
            market,
            first.selection(),
            first.bookmaker,
            second.selection(),
            second.bookmaker,
        );

        debug!(
            id = %id,
            profit = format!("{:.2}%", profit_percent),
            implied = format!("{:.2}%", total_implied * 100.0),
            total_stake = format!("${:.2}", total_stake),
            "Arbitrage found"
        );

        Ok(ArbitrageOpportunity {
            id,
            event: event.clone(),
            market: market.clone(),
            legs: [
                make_leg(first, stake1, payout1, p1),
                make_leg(second, stake2, payout2, p2),
            ],
            total_stake,
            guaranteed_profit,
            profit_percent,
            total_implied_probability: total_implied,
            found_at: now,
            expires_in_ms,
        })
    }
}

impl Default for ArbitrageDetector {
    fn default() -> Self {
        Self::new(Duration::minutes(super::normalizer::DEFAULT_MAX_QUOTE_AGE_MINS))
    }
}

pub(crate) fn make_leg(price: &BookPrice, stake: f64, payout: f64, implied: f64) -> OpportunityLeg {
    OpportunityLeg {
        bookmaker: price.bookmaker.clone(),
        bookmaker_title: price.bookmaker_title.clone(),
        selection: price.selection(),
        outcome_name: price.outcome_name.clone(),
        point: price.point,
        american_odds: price.price,
        decimal_odds: price.decimal_odds,
        stake,
        payout,
        implied_probability: implied,
        last_update: price.last_update,
    }
}

/// Time until the older quote leaves the staleness window, capped by
/// time until the event starts (for events not yet started).
pub(crate) fn expires_in_ms(
    event: &EventDescriptor,
    first: &BookPrice,
    second: &BookPrice,
    quote_window: Duration,
    now: DateTime<Utc>,
) -> i64 {
    let oldest = first.last_update.min(second.last_update);
    let quote_expiry = oldest + quote_window;
    let deadline = if event.commence_time > now {
        quote_expiry.min(event.commence_time)
    } else {
        quote_expiry
    };
    (deadline - now).num_milliseconds().max(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
