// =============================================================================
// Provider REST Client — aggregates, last trade, previous close
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

/// Base URL for all REST endpoints.
const REST_BASE: &str = "https://api.polygon.io";
/// Default per-request timeout; callers override for the heavier pulls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// One aggregate bar from `/v2/aggs/.../range/...`.
#[derive(Debug, Clone, Deserialize)]
pub struct AggBar {
    /// Bar start, epoch milliseconds.
    #[serde(default)]
    pub t: i64,
    #[serde(default)]
    pub o: f64,
    #[serde(default)]
    pub h: f64,
    #[serde(default)]
    pub l: f64,
    #[serde(default)]
    pub c: f64,
    #[serde(default)]
    pub v: f64,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    results: Vec<AggBar>,
}

#[derive(Debug, Deserialize)]
struct LastTradeResponse {
    results: Option<LastTradeRecord>,
}

#[derive(Debug, Deserialize)]
struct LastTradeRecord {
    #[serde(default)]
    p: f64,
    #[serde(default)]
    t: i64,
}

/// Price and millisecond timestamp of the most recent trade.
#[derive(Debug, Clone, Copy)]
pub struct LastTrade {
    pub price: f64,
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin typed client over the provider's REST API. The API key rides as a
/// query parameter on every call.
#[derive(Clone)]
pub struct ProviderRestClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl ProviderRestClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            api_key: api_key.into(),
            base_url: REST_BASE.to_string(),
            client,
        }
    }

    /// GET `/v2/aggs/ticker/<T>/range/<mult>/<unit>/<from>/<to>` — historical
    /// aggregate bars, ascending, up to `limit`.
    pub async fn fetch_range(
        &self,
        ticker: &str,
        multiplier: u64,
        timespan: &str,
        from: NaiveDate,
        to: NaiveDate,
        limit: u32,
        timeout: Duration,
    ) -> Result<Vec<AggBar>> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit={}&apiKey={}",
            self.base_url, ticker, multiplier, timespan, from, to, limit, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .context("aggregate range request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("aggregate range request for {ticker} returned {status}");
        }

        let body: RangeResponse = resp
            .json()
            .await
            .context("failed to parse aggregate range response")?;
        Ok(body.results)
    }

    /// GET `/v2/last/trade/<T>` — most recent trade print. `None` when the
    /// provider has no positive price for the ticker.
    pub async fn fetch_last_trade(&self, ticker: &str) -> Result<Option<LastTrade>> {
        let url = format!(
            "{}/v2/last/trade/{}?apiKey={}",
            self.base_url, ticker, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("last-trade request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("last-trade request for {ticker} returned {status}");
        }

        let body: LastTradeResponse = resp
            .json()
            .await
            .context("failed to parse last-trade response")?;

        Ok(body.results.and_then(|r| {
            (r.p > 0.0).then(|| LastTrade {
                price: r.p,
                timestamp_ms: normalize_timestamp_ms(r.t),
            })
        }))
    }

    /// GET `/v2/aggs/ticker/<T>/prev` — previous session's aggregate,
    /// used as a fallback when the last-trade endpoint has nothing.
    pub async fn fetch_prev_close(&self, ticker: &str) -> Result<Option<f64>> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/prev?adjusted=true&apiKey={}",
            self.base_url, ticker, self.api_key
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("previous-aggregate request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("previous-aggregate request for {ticker} returned {status}");
        }

        let body: RangeResponse = resp
            .json()
            .await
            .context("failed to parse previous-aggregate response")?;
        Ok(body.results.first().map(|bar| bar.c).filter(|c| *c > 0.0))
    }
}

// ---------------------------------------------------------------------------
// Request math shared by bootstrap, poller, and timeframe reloads
// ---------------------------------------------------------------------------

/// Remote timestamps arrive in seconds, milliseconds, microseconds, or
/// nanoseconds depending on the endpoint. Normalize to milliseconds by
/// magnitude.
pub fn normalize_timestamp_ms(raw: i64) -> i64 {
    if raw > 100_000_000_000_000_000 {
        raw / 1_000_000 // nanoseconds
    } else if raw > 100_000_000_000_000 {
        raw / 1_000 // microseconds
    } else if raw > 100_000_000_000 {
        raw // already milliseconds
    } else {
        raw * 1_000 // seconds
    }
}

/// Provider (multiplier, timespan) pair for a timeframe in seconds.
pub fn timespan_for(timeframe_secs: u64) -> (u64, &'static str) {
    if timeframe_secs < 60 {
        (timeframe_secs, "second")
    } else if timeframe_secs < 3_600 {
        (timeframe_secs / 60, "minute")
    } else {
        (timeframe_secs / 3_600, "hour")
    }
}

/// Calendar days of history needed for ~500 bars of the given timeframe:
/// convert to 6.5-hour trading days, pad 50 % plus three days for weekends
/// and holidays, clamp to [3, 60].
pub fn history_window_days(timeframe_secs: u64) -> i64 {
    let hours_needed = (500 * timeframe_secs) as f64 / 3_600.0;
    let trading_days = (hours_needed / 6.5).ceil().max(1.0);
    let calendar_days = (trading_days * 1.5) as i64 + 3;
    calendar_days.clamp(3, 60)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_normalization_by_magnitude() {
        let ms = 1_700_000_000_123_i64;
        assert_eq!(normalize_timestamp_ms(ms), ms);
        assert_eq!(normalize_timestamp_ms(ms * 1_000), ms); // microseconds
        assert_eq!(normalize_timestamp_ms(ms * 1_000_000), ms); // nanoseconds
        assert_eq!(normalize_timestamp_ms(1_700_000_000), 1_700_000_000_000); // seconds
    }

    #[test]
    fn timespan_mapping() {
        assert_eq!(timespan_for(5), (5, "second"));
        assert_eq!(timespan_for(59), (59, "second"));
        assert_eq!(timespan_for(60), (1, "minute"));
        assert_eq!(timespan_for(300), (5, "minute"));
        assert_eq!(timespan_for(900), (15, "minute"));
        assert_eq!(timespan_for(3_600), (1, "hour"));
        assert_eq!(timespan_for(14_400), (4, "hour"));
    }

    #[test]
    fn history_window_clamps_and_scales() {
        // 5 s bars: tiny need, one trading day padded to 4 calendar days.
        assert_eq!(history_window_days(5), 4);
        // 1 m bars: 500 min ≈ 8.3 h → 2 trading days → 6 calendar days.
        assert_eq!(history_window_days(60), 6);
        // 5 m bars: ≈ 41.7 h → 7 trading days → 13 calendar days.
        assert_eq!(history_window_days(300), 13);
        // 1 h bars: 500 h → 77 trading days → clamped to 60.
        assert_eq!(history_window_days(3_600), 60);
    }

    #[test]
    fn five_minute_reload_covers_at_least_a_week() {
        assert!(history_window_days(300) >= 7);
    }
}
