// =============================================================================
// Historical Bootstrap — one-shot REST load of minute bars at startup
// =============================================================================
//
// Pre-populates each symbol's replay buffer with the close of every
// 1-minute bar in the lookback window, so the first browser to connect
// sees a full chart instead of an empty one. Runs once, before the live
// feeds attach.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::America::New_York;
use tracing::{error, info, warn};

use crate::fanout::TickFanoutServer;
use crate::session_clock;
use crate::symbols::{self, AssetKind};
use crate::upstream::rest::{history_window_days, ProviderRestClient};

/// The bootstrap pull is the heaviest REST call the engine makes.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);
/// Bars requested per symbol for the initial load.
const BOOTSTRAP_LIMIT: u32 = 50_000;
/// Bootstrap always loads the default one-minute timeframe.
const BOOTSTRAP_TIMEFRAME_SECS: u64 = 60;

/// Load minute-bar closes into the tick server's replay buffers. Returns
/// the last known price per symbol, which seeds the synthetic
/// closed-market books. Failures are per-symbol: log and move on.
pub async fn bootstrap_history(
    client: &ProviderRestClient,
    symbols_list: &[String],
    tick_server: &TickFanoutServer,
) -> HashMap<String, f64> {
    let days = history_window_days(BOOTSTRAP_TIMEFRAME_SECS);
    let today = Utc::now().with_timezone(&New_York).date_naive();
    let from = today - chrono::Days::new(days as u64);
    info!(from = %from, to = %today, days, "loading historical minute bars");

    let mut last_prices = HashMap::new();

    for symbol in symbols_list {
        let ticker = symbols::provider_ticker(symbol);
        let bars = match client
            .fetch_range(&ticker, 1, "minute", from, today, BOOTSTRAP_LIMIT, BOOTSTRAP_TIMEOUT)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "historical load failed");
                continue;
            }
        };
        if bars.is_empty() {
            warn!(symbol = %symbol, "no historical bars returned");
            continue;
        }

        let is_equity = symbols::classify(symbol) == AssetKind::Equity;
        let mut seeded = 0usize;
        for bar in &bars {
            if bar.t == 0 || bar.c == 0.0 {
                continue;
            }
            let epoch_secs = bar.t.div_euclid(1000);
            if is_equity && !session_clock::in_extended_hours(epoch_secs) {
                continue;
            }
            tick_server.seed_point(symbol, epoch_secs, bar.c);
            seeded += 1;
        }

        if let Some(price) = tick_server.last_price(symbol) {
            last_prices.insert(symbol.clone(), price);
            info!(
                symbol = %symbol,
                bars = seeded,
                last_price = price,
                "historical bars loaded"
            );
        } else {
            warn!(symbol = %symbol, "history contained no usable bars");
        }
    }

    last_prices
}
