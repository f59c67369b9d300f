//! Shared types for SHARPLINE.
//!
//! These types form the data model used across all modules: raw odds
//! snapshots as delivered by the data provider, the opportunity records
//! produced by the detectors, the user-facing opportunity configuration,
//! and the error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Market keys
// ---------------------------------------------------------------------------

/// Betting market identifier, as used by the odds provider (`h2h`,
/// `spreads`, `totals`, `player_points`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MarketKey {
    Moneyline,
    Spreads,
    Totals,
    AlternateSpreads,
    AlternateTotals,
    /// Player proposition market, e.g. `player_points`.
    PlayerProp(String),
    Other(String),
}

/// Structural family of a market, which decides how outcomes pair up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketKind {
    Moneyline,
    Spread,
    Total,
    PlayerProp,
    Other,
}

impl MarketKey {
    pub fn as_str(&self) -> &str {
        match self {
            MarketKey::Moneyline => "h2h",
            MarketKey::Spreads => "spreads",
            MarketKey::Totals => "totals",
            MarketKey::AlternateSpreads => "alternate_spreads",
            MarketKey::AlternateTotals => "alternate_totals",
            MarketKey::PlayerProp(key) | MarketKey::Other(key) => key,
        }
    }

    pub fn kind(&self) -> MarketKind {
        match self {
            MarketKey::Moneyline => MarketKind::Moneyline,
            MarketKey::Spreads | MarketKey::AlternateSpreads => MarketKind::Spread,
            MarketKey::Totals | MarketKey::AlternateTotals => MarketKind::Total,
            MarketKey::PlayerProp(_) => MarketKind::PlayerProp,
            MarketKey::Other(_) => MarketKind::Other,
        }
    }

    /// Markets whose outcomes carry a point/line value.
    pub fn is_line_market(&self) -> bool {
        matches!(
            self.kind(),
            MarketKind::Spread | MarketKind::Total | MarketKind::PlayerProp
        )
    }
}

impl From<String> for MarketKey {
    fn from(key: String) -> Self {
        match key.to_lowercase().as_str() {
            "h2h" | "moneyline" => MarketKey::Moneyline,
            "spreads" | "spread" => MarketKey::Spreads,
            "totals" | "total" => MarketKey::Totals,
            "alternate_spreads" => MarketKey::AlternateSpreads,
            "alternate_totals" => MarketKey::AlternateTotals,
            lower if lower.starts_with("player_") || lower.starts_with("batter_")
                || lower.starts_with("pitcher_") =>
            {
                MarketKey::PlayerProp(lower.to_string())
            }
            _ => MarketKey::Other(key),
        }
    }
}

impl From<&str> for MarketKey {
    fn from(key: &str) -> Self {
        MarketKey::from(key.to_string())
    }
}

impl From<MarketKey> for String {
    fn from(key: MarketKey) -> Self {
        key.as_str().to_string()
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Odds snapshot (provider payload, validated)
// ---------------------------------------------------------------------------

/// A single priced outcome within a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Team name, "Over"/"Under", "Draw", ...
    pub name: String,
    /// American odds. Zero is degenerate and excluded from detection.
    pub price: i32,
    /// Line value for spreads, totals and props.
    #[serde(default)]
    pub point: Option<f64>,
    /// Player name for prop markets.
    #[serde(default)]
    pub description: Option<String>,
}

/// One market as quoted by one bookmaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketLine {
    pub key: MarketKey,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

/// All markets quoted by one bookmaker for an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmakerQuote {
    pub key: String,
    pub title: String,
    pub last_update: DateTime<Utc>,
    pub markets: Vec<MarketLine>,
}

impl BookmakerQuote {
    pub fn market(&self, key: &MarketKey) -> Option<&MarketLine> {
        self.markets.iter().find(|m| &m.key == key)
    }
}

/// Every bookmaker's quotes for a single event. Replaced wholesale on
/// each successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Provider event id.
    pub id: String,
    pub sport_key: String,
    #[serde(default)]
    pub sport_title: String,
    pub commence_time: DateTime<Utc>,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    pub bookmakers: Vec<BookmakerQuote>,
}

impl MarketSnapshot {
    pub fn event(&self) -> EventDescriptor {
        EventDescriptor {
            event_id: self.id.clone(),
            sport_key: self.sport_key.clone(),
            home_team: self.home_team.clone(),
            away_team: self.away_team.clone(),
            commence_time: self.commence_time,
        }
    }

    /// In progress or already completed.
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.commence_time <= now
    }
}

/// Identifies the event an opportunity belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub event_id: String,
    pub sport_key: String,
    pub home_team: String,
    pub away_team: String,
    pub commence_time: DateTime<Utc>,
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} ({}, {})",
            self.away_team,
            self.home_team,
            self.sport_key,
            self.commence_time.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

// ---------------------------------------------------------------------------
// Opportunities
// ---------------------------------------------------------------------------

/// One side of a two-leg opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityLeg {
    pub bookmaker: String,
    pub bookmaker_title: String,
    /// Human readable selection, e.g. "Over 45.5" or "Chiefs -3.5".
    pub selection: String,
    pub outcome_name: String,
    pub point: Option<f64>,
    pub american_odds: i32,
    pub decimal_odds: f64,
    pub stake: f64,
    /// Gross return (stake included) if this leg wins.
    pub payout: f64,
    /// 1 / decimal odds (0.0–1.0).
    pub implied_probability: f64,
    pub last_update: DateTime<Utc>,
}

/// Guaranteed-profit stake split across two bookmakers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    /// Unique within one detection generation only.
    pub id: String,
    pub event: EventDescriptor,
    pub market: MarketKey,
    pub legs: [OpportunityLeg; 2],
    pub total_stake: f64,
    pub guaranteed_profit: f64,
    pub profit_percent: f64,
    /// Sum of both legs' implied probabilities (0.0–1.0). Always < 1.
    pub total_implied_probability: f64,
    pub found_at: DateTime<Utc>,
    pub expires_in_ms: i64,
}

impl fmt::Display for ArbitrageOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ARB {:.2}% ${:.2} on ${:.2} | {} {} | {} {:+} @ {} / {} {:+} @ {}",
            self.profit_percent,
            self.guaranteed_profit,
            self.total_stake,
            self.event,
            self.market,
            self.legs[0].selection,
            self.legs[0].american_odds,
            self.legs[0].bookmaker,
            self.legs[1].selection,
            self.legs[1].american_odds,
            self.legs[1].bookmaker,
        )
    }
}

/// Result interval that wins both legs of a middle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MiddleRange {
    pub low: f64,
    pub high: f64,
}

impl fmt::Display for MiddleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}–{}", self.low, self.high)
    }
}

/// Two differing lines that both win if the result lands in the gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddleOpportunity {
    pub id: String,
    pub event: EventDescriptor,
    pub market: MarketKey,
    pub gap: f64,
    pub middle_range: MiddleRange,
    /// Heuristic hit probability (0.0–1.0), not a calibrated model.
    pub win_probability: f64,
    pub legs: [OpportunityLeg; 2],
    pub total_stake: f64,
    /// Best case, conditional on the result landing in the gap.
    pub max_profit: f64,
    /// Profit when only one leg wins. Usually a small loss.
    pub miss_profit: f64,
    pub expected_value: f64,
    pub found_at: DateTime<Utc>,
    pub expires_in_ms: i64,
}

impl MiddleOpportunity {
    pub fn max_profit_percent(&self) -> f64 {
        if self.total_stake > 0.0 {
            self.max_profit / self.total_stake * 100.0
        } else {
            0.0
        }
    }
}

impl fmt::Display for MiddleOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MIDDLE gap {} ({}) hit ~{:.0}% max ${:.2} miss ${:.2} | {} {} | {} @ {} / {} @ {}",
            self.gap,
            self.middle_range,
            self.win_probability * 100.0,
            self.max_profit,
            self.miss_profit,
            self.event,
            self.market,
            self.legs[0].selection,
            self.legs[0].bookmaker,
            self.legs[1].selection,
            self.legs[1].bookmaker,
        )
    }
}

// ---------------------------------------------------------------------------
// Opportunity configuration
// ---------------------------------------------------------------------------

/// Ordering applied to opportunity lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Highest profit percent first.
    #[default]
    ProfitPercent,
    /// Highest absolute profit first.
    ProfitAmount,
    /// Most recently found first.
    FoundAt,
    /// Soonest to expire first.
    ExpiresIn,
}

/// User-supplied thresholds and filters. Empty sets mean "no filter".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpportunityConfig {
    pub min_profit_percent: f64,
    pub min_middle_gap: f64,
    /// Fraction (0.0–1.0).
    pub min_middle_probability: f64,
    pub max_stake: f64,
    pub selected_markets: HashSet<MarketKey>,
    pub selected_sports: HashSet<String>,
    pub book_filter: HashSet<String>,
    pub sort_by: SortBy,
}

impl Default for OpportunityConfig {
    fn default() -> Self {
        Self {
            min_profit_percent: 0.5,
            min_middle_gap: 0.5,
            min_middle_probability: 0.0,
            max_stake: 1000.0,
            selected_markets: HashSet::new(),
            selected_sports: HashSet::new(),
            book_filter: HashSet::new(),
            sort_by: SortBy::ProfitPercent,
        }
    }
}

impl OpportunityConfig {
    /// Reject thresholds that cannot be meaningfully applied.
    pub fn validate(&self) -> Result<(), SharplineError> {
        let non_negative = [
            ("min_profit_percent", self.min_profit_percent),
            ("min_middle_gap", self.min_middle_gap),
            ("min_middle_probability", self.min_middle_probability),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SharplineError::Configuration(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.min_middle_probability > 1.0 {
            return Err(SharplineError::Configuration(format!(
                "min_middle_probability is a fraction (0.0–1.0), got {}",
                self.min_middle_probability
            )));
        }
        if !self.max_stake.is_finite() || self.max_stake <= 0.0 {
            return Err(SharplineError::Configuration(format!(
                "max_stake must be positive, got {}",
                self.max_stake
            )));
        }
        Ok(())
    }

    pub fn allows_market(&self, market: &MarketKey) -> bool {
        self.selected_markets.is_empty() || self.selected_markets.contains(market)
    }

    pub fn allows_sport(&self, sport_key: &str) -> bool {
        self.selected_sports.is_empty() || self.selected_sports.contains(sport_key)
    }

    pub fn allows_book(&self, bookmaker: &str) -> bool {
        self.book_filter.is_empty() || self.book_filter.contains(bookmaker)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for SHARPLINE.
///
/// `Clone` because a single coalesced fetch outcome is handed to every
/// waiter attached to it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SharplineError {
    #[error("Network error ({source_name}): {message}")]
    Network { source_name: String, message: String },

    #[error("Malformed data ({context}): {message}")]
    MalformedData { context: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Degenerate odds: {0}")]
    ArithmeticDegenerate(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request superseded by a newer request")]
    Superseded,
}

impl SharplineError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SharplineError::Network { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
