//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheConfig, RetryPolicy};
use crate::engine::{PollingConfig, TrackerConfig};
use crate::feed::the_odds_api::DEFAULT_BASE_URL;
use crate::feed::OddsRequest;
use crate::strategy::middle::LinearGapModel;
use crate::strategy::normalizer::{NormalizerConfig, DFS_BOOKMAKERS};
use crate::strategy::DetectionSettings;
use crate::types::{MarketKey, OpportunityConfig};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub feed: FeedConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub opportunity: OpportunityConfig,
    #[serde(default)]
    pub detection: DetectionSection,
    pub bankroll: BankrollSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key_env: String,
    pub regions: Vec<String>,
    pub sports: Vec<String>,
    pub markets: Vec<String>,
    #[serde(default)]
    pub bookmakers: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub max_stale_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            max_stale_secs: 600,
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingSection {
    pub interval_secs: u64,
    pub continuous: bool,
    pub refresh_on_start: bool,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            continuous: false,
            refresh_on_start: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionSection {
    pub quote_window_mins: i64,
    pub middle_bankroll_fraction: f64,
    pub excluded_bookmakers: Vec<String>,
    pub hit_model_per_point: f64,
    pub hit_model_cap: f64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        let model = LinearGapModel::default();
        Self {
            quote_window_mins: crate::strategy::normalizer::DEFAULT_MAX_QUOTE_AGE_MINS,
            middle_bankroll_fraction: crate::strategy::middle::DEFAULT_MIDDLE_BANKROLL_FRACTION,
            excluded_bookmakers: DFS_BOOKMAKERS.iter().map(|s| s.to_string()).collect(),
            hit_model_per_point: model.per_point,
            hit_model_cap: model.cap,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BankrollSection {
    pub amount: f64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    15
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    pub fn validate(&self) -> Result<()> {
        self.opportunity.validate()?;
        if self.feed.sports.is_empty() || self.feed.markets.is_empty() {
            bail!("[feed] needs at least one sport and one market");
        }
        if self.polling.interval_secs == 0 {
            bail!("[polling] interval_secs must be positive");
        }
        if self.cache.ttl_secs == 0 || self.cache.max_stale_secs < self.cache.ttl_secs {
            bail!("[cache] requires 0 < ttl_secs <= max_stale_secs");
        }
        let fraction = self.detection.middle_bankroll_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            bail!("[detection] middle_bankroll_fraction must be in (0, 1], got {fraction}");
        }
        if self.detection.quote_window_mins <= 0 {
            bail!("[detection] quote_window_mins must be positive");
        }
        if !(self.bankroll.amount.is_finite() && self.bankroll.amount >= 0.0) {
            bail!("[bankroll] amount must be a non-negative number");
        }
        Ok(())
    }

    // -- Component configs -------------------------------------------------

    pub fn odds_request(&self) -> OddsRequest {
        OddsRequest {
            sports: self.feed.sports.clone(),
            markets: self.feed.markets.iter().map(|m| MarketKey::from(m.as_str())).collect(),
            regions: self.feed.regions.clone(),
            bookmakers: self.feed.bookmakers.clone(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache.ttl_secs),
            max_stale: Duration::from_secs(self.cache.max_stale_secs),
            retry: RetryPolicy {
                max_retries: self.cache.max_retries,
                base_backoff: Duration::from_millis(self.cache.base_backoff_ms),
                max_backoff: Duration::from_millis(self.cache.max_backoff_ms),
            },
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_secs(self.polling.interval_secs),
            continuous: self.polling.continuous,
            refresh_on_start: self.polling.refresh_on_start,
        }
    }

    pub fn detection_settings(&self) -> DetectionSettings {
        DetectionSettings {
            normalizer: NormalizerConfig {
                max_quote_age: chrono::Duration::minutes(self.detection.quote_window_mins),
                excluded_bookmakers: self.detection.excluded_bookmakers.iter().cloned().collect(),
            },
            middle_bankroll_fraction: self.detection.middle_bankroll_fraction,
            hit_model: Arc::new(LinearGapModel {
                per_point: self.detection.hit_model_per_point,
                cap: self.detection.hit_model_cap,
            }),
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            request: self.odds_request(),
            opportunity: self.opportunity.clone(),
            ttl: Duration::from_secs(self.cache.ttl_secs),
            max_stale: Duration::from_secs(self.cache.max_stale_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SortBy;

    const MINIMAL: &str = r#"
        [feed]
        api_key_env = "ODDS_API_KEY"
        regions = ["us"]
        sports = ["basketball_nba"]
        markets = ["h2h", "totals"]

        [bankroll]
        amount = 2500.0
    "#;

    #[test]
    fn test_load_shipped_config() {
        let cfg = AppConfig::from_toml_str(include_str!("../config.toml")).unwrap();
        assert_eq!(cfg.feed.api_key_env, "ODDS_API_KEY");
        assert!(!cfg.feed.sports.is_empty());
        assert!(cfg.bankroll.amount > 0.0);
        assert!(cfg.cache.ttl_secs <= cfg.cache.max_stale_secs);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.feed.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.polling.interval_secs, 120);
        assert_eq!(cfg.opportunity.sort_by, SortBy::ProfitPercent);
        assert_eq!(cfg.detection.middle_bankroll_fraction, 0.10);
        assert!(cfg.detection.excluded_bookmakers.contains(&"prizepicks".to_string()));

        let req = cfg.odds_request();
        assert_eq!(req.markets, vec![MarketKey::Moneyline, MarketKey::Totals]);

        let cache = cfg.cache_config();
        assert_eq!(cache.default_ttl, Duration::from_secs(60));
        assert_eq!(cache.retry.base_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_opportunity_section_parses() {
        let toml = format!(
            "{MINIMAL}\n[opportunity]\nmin_profit_percent = 1.5\nmax_stake = 200.0\nsort_by = \"expires_in\"\nbook_filter = [\"fanduel\"]\n"
        );
        let cfg = AppConfig::from_toml_str(&toml).unwrap();
        assert_eq!(cfg.opportunity.min_profit_percent, 1.5);
        assert_eq!(cfg.opportunity.max_stake, 200.0);
        assert_eq!(cfg.opportunity.sort_by, SortBy::ExpiresIn);
        assert!(cfg.opportunity.allows_book("fanduel"));
        assert!(!cfg.opportunity.allows_book("betmgm"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let negative = format!("{MINIMAL}\n[opportunity]\nmin_middle_gap = -1.0\n");
        assert!(AppConfig::from_toml_str(&negative).is_err());

        let zero_interval = format!("{MINIMAL}\n[polling]\ninterval_secs = 0\n");
        assert!(AppConfig::from_toml_str(&zero_interval).is_err());

        let bad_fraction = format!("{MINIMAL}\n[detection]\nmiddle_bankroll_fraction = 1.5\n");
        assert!(AppConfig::from_toml_str(&bad_fraction).is_err());
    }

    #[test]
    fn test_resolve_env_missing() {
        assert!(AppConfig::resolve_env("SHARPLINE_SURELY_UNSET_VAR_12345").is_err());
    }
}
