//! The Odds API integration.
//!
//! API docs: https://the-odds-api.com/liveapi/guides/v4/
//! Endpoint: `GET {base}/v4/sports/{sport}/odds`
//! Auth: `apiKey` query parameter. Every request costs quota
//! (markets × regions), which is why callers go through the fetch cache.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_events, OddsRequest, OddsSource};
use crate::types::{MarketSnapshot, SharplineError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://api.the-odds-api.com";
const SOURCE_NAME: &str = "the-odds-api";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TheOddsApiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl TheOddsApiClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("SHARPLINE/0.1.0 (odds-watcher)")
            .build()
            .context("Failed to build HTTP client for The Odds API")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Request URL without the API key, safe to log.
    fn odds_url(&self, sport: &str, request: &OddsRequest) -> String {
        let mut url = format!(
            "{}/v4/sports/{}/odds?regions={}&markets={}&oddsFormat=american&dateFormat=iso",
            self.base_url,
            urlencoding::encode(sport),
            urlencoding::encode(&request.regions.join(",")),
            urlencoding::encode(&request.markets_param()),
        );
        if !request.bookmakers.is_empty() {
            url.push_str("&bookmakers=");
            url.push_str(&urlencoding::encode(&request.bookmakers.join(",")));
        }
        url
    }

    async fn fetch_sport(
        &self,
        sport: &str,
        request: &OddsRequest,
    ) -> Result<Vec<MarketSnapshot>, SharplineError> {
        let url = self.odds_url(sport, request);
        debug!(url = %url, "Fetching odds");

        let resp = self
            .http
            .get(format!("{url}&apiKey={}", urlencoding::encode(&self.api_key)))
            .send()
            .await
            .map_err(|e| network_error(format!("request failed: {e}")))?;

        let status = resp.status();
        if let Some(remaining) = resp
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
        {
            debug!(sport, remaining, "Odds API quota");
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| network_error(format!("failed to read body: {e}")))?;

        let parsed = parse_events(sport, &body)?;
        if parsed.skipped > 0 {
            warn!(sport, skipped = parsed.skipped, "Skipped malformed odds entries");
        }
        Ok(parsed.snapshots)
    }
}

fn network_error(message: String) -> SharplineError {
    SharplineError::Network {
        source_name: SOURCE_NAME.to_string(),
        message,
    }
}

/// Server-side and rate-limit failures are transient; auth and request
/// errors are not worth retrying.
fn classify_status(status: StatusCode, body: &str) -> SharplineError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        network_error(format!("HTTP {status}: {body}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SharplineError::Configuration(format!("The Odds API rejected the API key ({status})"))
    } else {
        SharplineError::MalformedData {
            context: SOURCE_NAME.to_string(),
            message: format!("HTTP {status}: {body}"),
        }
    }
}

// ---------------------------------------------------------------------------
// OddsSource trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl OddsSource for TheOddsApiClient {
    /// One request per sport. Any failing sport fails the whole fetch so
    /// the cache never holds a partial snapshot.
    async fn fetch_odds(
        &self,
        request: &OddsRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MarketSnapshot>, SharplineError> {
        let mut snapshots = Vec::new();

        for sport in &request.sports {
            let events = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SharplineError::Cancelled),
                r = self.fetch_sport(sport, request) => r?,
            };
            debug!(sport = %sport, events = events.len(), "Fetched sport odds");
            snapshots.extend(events);
        }

        info!(
            sports = request.sports.len(),
            events = snapshots.len(),
            "Odds feed refreshed"
        );
        Ok(snapshots)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
