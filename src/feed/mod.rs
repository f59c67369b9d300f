//! Odds data providers.
//!
//! Defines the `OddsSource` trait consumed by the tracker, and the
//! payload parser shared by HTTP implementations.

pub mod the_odds_api;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::generate_key;
use crate::types::{BookmakerQuote, MarketKey, MarketLine, MarketSnapshot, SharplineError};

pub use the_odds_api::TheOddsApiClient;

/// What to ask a source for. Also determines the cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct OddsRequest {
    pub sports: Vec<String>,
    pub markets: Vec<MarketKey>,
    pub regions: Vec<String>,
    /// Empty means every bookmaker the source carries.
    pub bookmakers: Vec<String>,
}

impl OddsRequest {
    pub fn markets_param(&self) -> String {
        self.markets.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(",")
    }

    /// Stable cache key for this request against `endpoint`.
    pub fn cache_key(&self, endpoint: &str) -> String {
        let sports = self.sports.join(",");
        let markets = self.markets_param();
        let regions = self.regions.join(",");
        let bookmakers = self.bookmakers.join(",");
        generate_key(
            endpoint,
            &[
                ("sports", sports.as_str()),
                ("markets", markets.as_str()),
                ("regions", regions.as_str()),
                ("bookmakers", bookmakers.as_str()),
            ],
        )
    }
}

/// Abstraction over odds feeds.
#[async_trait]
pub trait OddsSource: Send + Sync {
    /// Fetch current snapshots for every sport in `request`.
    ///
    /// Implementations must stop promptly and return
    /// `SharplineError::Cancelled` once `cancel` fires.
    async fn fetch_odds(
        &self,
        request: &OddsRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MarketSnapshot>, SharplineError>;

    /// Source name for logging and cache keys.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Tolerant payload parsing
// ---------------------------------------------------------------------------

/// Result of parsing one provider payload.
#[derive(Debug, Clone, Default)]
pub struct ParsedOdds {
    pub snapshots: Vec<MarketSnapshot>,
    /// Events, bookmakers or markets dropped as malformed.
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    sport_key: String,
    #[serde(default)]
    sport_title: String,
    commence_time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    home_team: String,
    #[serde(default)]
    away_team: String,
    #[serde(default)]
    bookmakers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawBookmaker {
    key: String,
    #[serde(default)]
    title: String,
    last_update: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    markets: Vec<serde_json::Value>,
}

/// Parse an event list, skipping malformed entries one at a time.
///
/// Only a body that is not a JSON array at all is an error. A market with
/// a non-integer price fails to deserialize and is skipped.
pub fn parse_events(context: &str, body: &str) -> Result<ParsedOdds, SharplineError> {
    let items: Vec<serde_json::Value> =
        serde_json::from_str(body).map_err(|e| SharplineError::MalformedData {
            context: context.to_string(),
            message: e.to_string(),
        })?;

    let mut parsed = ParsedOdds::default();
    for item in items {
        let raw: RawEvent = match serde_json::from_value(item) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(context, error = %e, "Skipping malformed event");
                parsed.skipped += 1;
                continue;
            }
        };

        let mut bookmakers = Vec::with_capacity(raw.bookmakers.len());
        for value in raw.bookmakers {
            let book: RawBookmaker = match serde_json::from_value(value) {
                Ok(b) => b,
                Err(e) => {
                    debug!(event_id = %raw.id, error = %e, "Skipping malformed bookmaker");
                    parsed.skipped += 1;
                    continue;
                }
            };

            let mut markets = Vec::with_capacity(book.markets.len());
            for value in book.markets {
                match serde_json::from_value::<MarketLine>(value) {
                    Ok(m) if m.outcomes.iter().all(|o| !o.name.is_empty()) => markets.push(m),
                    Ok(_) => parsed.skipped += 1,
                    Err(e) => {
                        debug!(event_id = %raw.id, bookmaker = %book.key, error = %e, "Skipping malformed market");
                        parsed.skipped += 1;
                    }
                }
            }

            let title = if book.title.is_empty() { book.key.clone() } else { book.title };
            bookmakers.push(BookmakerQuote {
                key: book.key,
                title,
                last_update: book.last_update,
                markets,
            });
        }

        parsed.snapshots.push(MarketSnapshot {
            id: raw.id,
            sport_key: raw.sport_key,
            sport_title: raw.sport_title,
            commence_time: raw.commence_time,
            home_team: raw.home_team,
            away_team: raw.away_team,
            bookmakers,
        });
    }

    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
