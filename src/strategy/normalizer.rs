//! Odds normalisation.
//!
//! Turns one event snapshot into a uniform outcome table for a single
//! market: every eligible bookmaker quote, plus the single best price per
//! outcome. Bookmakers are ineligible when they are DFS-style operators,
//! outside the user's book filter, or have not updated within the
//! staleness window.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::odds::{american_to_decimal, format_point};
use crate::types::{EventDescriptor, MarketKey, MarketSnapshot};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pick'em / DFS operators. Their "odds" are not bettable prices.
pub const DFS_BOOKMAKERS: &[&str] = &["prizepicks", "underdog", "pick6", "betr_us_dfs", "sleeper"];

/// Default staleness window for a bookmaker's quotes.
pub const DEFAULT_MAX_QUOTE_AGE_MINS: i64 = 30;

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Quotes whose bookmaker last updated longer ago than this are dropped.
    pub max_quote_age: Duration,
    pub excluded_bookmakers: HashSet<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_quote_age: Duration::minutes(DEFAULT_MAX_QUOTE_AGE_MINS),
            excluded_bookmakers: DFS_BOOKMAKERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// A single bookmaker's price for a single outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct BookPrice {
    pub bookmaker: String,
    pub bookmaker_title: String,
    pub outcome_name: String,
    pub description: Option<String>,
    pub point: Option<f64>,
    pub price: i32,
    pub decimal_odds: f64,
    pub last_update: DateTime<Utc>,
}

impl BookPrice {
    /// Display label, e.g. "Over 45.5", "Chiefs -3.5", "J. Allen Over 1.5".
    pub fn selection(&self) -> String {
        let mut label = match &self.description {
            Some(player) => format!("{player} {}", self.outcome_name),
            None => self.outcome_name.clone(),
        };
        if let Some(point) = self.point {
            let is_total = self.outcome_name.eq_ignore_ascii_case("over")
                || self.outcome_name.eq_ignore_ascii_case("under");
            if is_total {
                label.push_str(&format!(" {point}"));
            } else {
                label.push_str(&format!(" {}", format_point(point)));
            }
        }
        label
    }
}

/// Uniform outcome table for one market of one event.
#[derive(Debug, Clone)]
pub struct NormalizedMarket {
    pub event: EventDescriptor,
    pub market: MarketKey,
    /// Best price per (outcome, description, line), in first-seen order.
    pub best: Vec<BookPrice>,
    /// Every eligible quote, in input order.
    pub quotes: Vec<BookPrice>,
    /// Outcomes dropped for a zero/invalid price.
    pub degenerate_outcomes: usize,
    /// Bookmakers dropped for stale quotes.
    pub stale_bookmakers: Vec<String>,
}

impl NormalizedMarket {
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OutcomeKey {
    name: String,
    description: Option<String>,
    point_bits: Option<u64>,
}

impl OutcomeKey {
    fn of(price: &BookPrice) -> Self {
        Self {
            name: price.outcome_name.to_lowercase(),
            description: price.description.as_ref().map(|d| d.to_lowercase()),
            // `+ 0.0` folds -0.0 into 0.0
            point_bits: price.point.map(|p| (p + 0.0).to_bits()),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

pub struct OddsNormalizer {
    config: NormalizerConfig,
}

impl OddsNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Whether a bookmaker's quote is recent enough to act on.
    pub fn is_fresh(&self, last_update: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last_update <= self.config.max_quote_age
    }

    /// Build the outcome table for `market` from one snapshot.
    ///
    /// Ties on exactly equal best prices keep the first bookmaker in input
    /// order. The choice is arbitrary but deterministic.
    pub fn normalize(
        &self,
        snapshot: &MarketSnapshot,
        market: &MarketKey,
        book_filter: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> NormalizedMarket {
        let mut quotes = Vec::new();
        let mut degenerate_outcomes = 0usize;
        let mut stale_bookmakers = Vec::new();

        for book in &snapshot.bookmakers {
            if self.config.excluded_bookmakers.contains(&book.key) {
                continue;
            }
            if !book_filter.is_empty() && !book_filter.contains(&book.key) {
                continue;
            }
            if !self.is_fresh(book.last_update, now) {
                stale_bookmakers.push(book.key.clone());
                continue;
            }
            let Some(line) = book.market(market) else {
                continue;
            };

            for outcome in &line.outcomes {
                if market.is_line_market() && outcome.point.is_none() {
                    debug!(
                        event_id = %snapshot.id,
                        bookmaker = %book.key,
                        outcome = %outcome.name,
                        "Line market outcome without a point, skipping"
                    );
                    continue;
                }
                let decimal_odds = match american_to_decimal(outcome.price) {
                    Ok(d) => d,
                    Err(e) => {
                        debug!(
                            event_id = %snapshot.id,
                            bookmaker = %book.key,
                            error = %e,
                            "Excluding degenerate outcome"
                        );
                        degenerate_outcomes += 1;
                        continue;
                    }
                };
                quotes.push(BookPrice {
                    bookmaker: book.key.clone(),
                    bookmaker_title: book.title.clone(),
                    outcome_name: outcome.name.clone(),
                    description: outcome.description.clone(),
                    point: if market.is_line_market() { outcome.point } else { None },
                    price: outcome.price,
                    decimal_odds,
                    last_update: book.last_update,
                });
            }
        }

        let best = Self::best_prices(&quotes);

        if !stale_bookmakers.is_empty() {
            debug!(
                event_id = %snapshot.id,
                market = %market,
                stale = ?stale_bookmakers,
                "Dropped stale bookmakers"
            );
        }

        NormalizedMarket {
            event: snapshot.event(),
            market: market.clone(),
            best,
            quotes,
            degenerate_outcomes,
            stale_bookmakers,
        }
    }

    /// Keep the highest decimal price per outcome; replace only on a
    /// strictly better price so the first-seen bookmaker wins ties.
    fn best_prices(quotes: &[BookPrice]) -> Vec<BookPrice> {
        let mut index: HashMap<OutcomeKey, usize> = HashMap::new();
        let mut best: Vec<BookPrice> = Vec::new();

        for quote in quotes {
            let key = OutcomeKey::of(quote);
            match index.get(&key) {
                Some(&i) => {
                    if quote.decimal_odds > best[i].decimal_odds {
                        best[i] = quote.clone();
                    }
                }
                None => {
                    index.insert(key, best.len());
                    best.push(quote.clone());
                }
            }
        }
        best
    }
}

impl Default for OddsNormalizer {
    fn default() -> Self {
        Self::new(NormalizerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
