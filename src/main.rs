//! SHARPLINE: cached multi-book odds feed with arbitrage and middle detection.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the odds client, fetch cache, bankroll and tracker together,
//! then polls and logs ranked opportunities until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use sharpline::bankroll::SharedBankroll;
use sharpline::cache::FetchCache;
use sharpline::config;
use sharpline::engine::{AlwaysVisible, OpportunityTracker, TrackerState};
use sharpline::feed::TheOddsApiClient;
use sharpline::strategy::OpportunityPipeline;

const BANNER: &str = r#"
  ____  _   _    _    ____  ____  _     ___ _   _ _____
 / ___|| | | |  / \  |  _ \|  _ \| |   |_ _| \ | | ____|
 \___ \| |_| | / _ \ | |_) | |_) | |    | ||  \| |  _|
  ___) |  _  |/ ___ \|  _ <|  __/| |___ | || |\  | |___
 |____/|_| |_/_/   \_\_| \_\_|   |_____|___|_| \_|_____|

  Multi-book arbitrage and middle watcher
  v0.1.0
"#;

/// How many opportunities of each kind to log per update.
const TOP_N: usize = 5;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("SHARPLINE_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        sports = ?cfg.feed.sports,
        markets = ?cfg.feed.markets,
        interval_secs = cfg.polling.interval_secs,
        bankroll = format!("${:.2}", cfg.bankroll.amount),
        "SHARPLINE starting up"
    );

    // -- Initialise components -------------------------------------------

    let api_key = config::AppConfig::resolve_env(&cfg.feed.api_key_env)?;
    let client = TheOddsApiClient::new(
        &cfg.feed.base_url,
        api_key,
        Duration::from_secs(cfg.feed.request_timeout_secs),
    )?;

    let cache = FetchCache::new(cfg.cache_config());
    let bankroll = Arc::new(SharedBankroll::new(cfg.bankroll.amount));
    let pipeline = OpportunityPipeline::new(cfg.detection_settings());

    let tracker = OpportunityTracker::new(
        cache.clone(),
        Arc::new(client),
        bankroll,
        pipeline,
        cfg.tracker_config(),
    )
    .context("Failed to build opportunity tracker")?;

    tracker.start_polling(Arc::new(AlwaysVisible::new()), cfg.polling_config());

    // -- Main loop -------------------------------------------------------

    let mut updates = tracker.subscribe();
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Watching odds. Press Ctrl+C to stop.");

    let mut last_generation = 0;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Tracker closed its update channel");
                    break;
                }
                let state = updates.borrow_and_update().clone();
                if state.generation != last_generation {
                    last_generation = state.generation;
                    log_opportunities(&state);
                } else if let Some(e) = &state.error {
                    warn!(error = %e, stale = state.stale, "Odds refresh problem");
                }
            }
            _ = maintenance.tick() => {
                let evicted = cache.evict_expired();
                let stats = cache.stats();
                info!(
                    evicted,
                    entries = cache.len(),
                    hits = stats.hits,
                    stale_hits = stats.stale_hits,
                    misses = stats.misses,
                    coalesced = stats.coalesced,
                    network_calls = stats.network_calls,
                    retries = stats.retries,
                    "Cache maintenance"
                );
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    tracker.shutdown();
    cache.shutdown();
    info!(network_calls = cache.stats().network_calls, "SHARPLINE shut down cleanly.");

    Ok(())
}

/// Log a human-readable summary of the current lists.
fn log_opportunities(state: &TrackerState) {
    info!(
        generation = state.generation,
        events = state.events_scanned,
        arbitrage = state.arbitrage.len(),
        middles = state.middles.len(),
        stale = state.stale,
        "Opportunities updated"
    );
    if let Some(e) = &state.error {
        warn!(error = %e, "Showing last good odds");
    }
    for arb in state.arbitrage.iter().take(TOP_N) {
        info!(
            profit = format!("{:.2}%", arb.profit_percent),
            expires_in_secs = arb.expires_in_ms / 1000,
            "{arb}"
        );
    }
    for middle in state.middles.iter().take(TOP_N) {
        info!(
            win_probability = format!("{:.1}%", middle.win_probability * 100.0),
            ev = format!("${:.2}", middle.expected_value),
            "{middle}"
        );
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sharpline=info"));

    let json_logging = std::env::var("SHARPLINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
