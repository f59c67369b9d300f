//! Opportunity filtering and ranking.
//!
//! Pure functions over detector output. Both operations return new lists
//! and are idempotent: filtering or sorting an already filtered/sorted
//! list yields the same list. Ties are broken by id so ordering is fully
//! deterministic.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::types::{ArbitrageOpportunity, MarketKey, MiddleOpportunity, OpportunityConfig, SortBy};

/// Common view over opportunity kinds for filtering and sorting.
pub trait Ranked {
    fn id(&self) -> &str;
    fn profit_percent(&self) -> f64;
    fn profit_amount(&self) -> f64;
    fn found_at(&self) -> DateTime<Utc>;
    fn expires_in_ms(&self) -> i64;
    fn market(&self) -> &MarketKey;
    fn sport_key(&self) -> &str;
    fn bookmakers(&self) -> [&str; 2];
    /// Kind-specific numeric thresholds.
    fn meets_thresholds(&self, config: &OpportunityConfig) -> bool;
}

impl Ranked for ArbitrageOpportunity {
    fn id(&self) -> &str {
        &self.id
    }
    fn profit_percent(&self) -> f64 {
        self.profit_percent
    }
    fn profit_amount(&self) -> f64 {
        self.guaranteed_profit
    }
    fn found_at(&self) -> DateTime<Utc> {
        self.found_at
    }
    fn expires_in_ms(&self) -> i64 {
        self.expires_in_ms
    }
    fn market(&self) -> &MarketKey {
        &self.market
    }
    fn sport_key(&self) -> &str {
        &self.event.sport_key
    }
    fn bookmakers(&self) -> [&str; 2] {
        [&self.legs[0].bookmaker, &self.legs[1].bookmaker]
    }
    fn meets_thresholds(&self, config: &OpportunityConfig) -> bool {
        self.profit_percent >= config.min_profit_percent
    }
}

/// Middles rank on their best-case profit.
impl Ranked for MiddleOpportunity {
    fn id(&self) -> &str {
        &self.id
    }
    fn profit_percent(&self) -> f64 {
        self.max_profit_percent()
    }
    fn profit_amount(&self) -> f64 {
        self.max_profit
    }
    fn found_at(&self) -> DateTime<Utc> {
        self.found_at
    }
    fn expires_in_ms(&self) -> i64 {
        self.expires_in_ms
    }
    fn market(&self) -> &MarketKey {
        &self.market
    }
    fn sport_key(&self) -> &str {
        &self.event.sport_key
    }
    fn bookmakers(&self) -> [&str; 2] {
        [&self.legs[0].bookmaker, &self.legs[1].bookmaker]
    }
    fn meets_thresholds(&self, config: &OpportunityConfig) -> bool {
        self.gap >= config.min_middle_gap && self.win_probability >= config.min_middle_probability
    }
}

/// Drop entries below thresholds or outside the market/sport/book filters.
pub fn filter<T: Ranked + Clone>(opportunities: &[T], config: &OpportunityConfig) -> Vec<T> {
    opportunities
        .iter()
        .filter(|o| o.meets_thresholds(config))
        .filter(|o| config.allows_market(o.market()))
        .filter(|o| config.allows_sport(o.sport_key()))
        .filter(|o| o.bookmakers().iter().all(|b| config.allows_book(b)))
        .cloned()
        .collect()
}

/// Order by the requested key, ties broken by id ascending.
pub fn sort<T: Ranked + Clone>(opportunities: &[T], sort_by: SortBy) -> Vec<T> {
    let mut sorted = opportunities.to_vec();
    sorted.sort_by(|a, b| compare(a, b, sort_by));
    sorted
}

/// `filter` then `sort` with the config's own ordering.
pub fn rank<T: Ranked + Clone>(opportunities: &[T], config: &OpportunityConfig) -> Vec<T> {
    sort(&filter(opportunities, config), config.sort_by)
}

fn compare<T: Ranked>(a: &T, b: &T, sort_by: SortBy) -> Ordering {
    let primary = match sort_by {
        SortBy::ProfitPercent => b.profit_percent().total_cmp(&a.profit_percent()),
        SortBy::ProfitAmount => b.profit_amount().total_cmp(&a.profit_amount()),
        SortBy::FoundAt => b.found_at().cmp(&a.found_at()),
        SortBy::ExpiresIn => a.expires_in_ms().cmp(&b.expires_in_ms()),
    };
    primary.then_with(|| a.id().cmp(b.id()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
