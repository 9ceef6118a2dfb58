// =============================================================================
// REST Price Poller — push-feed emulation for symbols without a stream
// =============================================================================
//
// Crypto symbols on plans without the streaming feed are polled over REST:
// last-trade first, previous-aggregate as fallback. A trade event goes out
// only when the observed price moved, together with a synthetic 15-level
// book so the depth ladder stays alive for these symbols.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::market_data::{synthetic, BookSnapshot, Trade, TradeSender};
use crate::symbols;
use crate::upstream::rest::ProviderRestClient;

/// Poll cycle period.
const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

pub struct RestPricePoller {
    client: ProviderRestClient,
    symbols: Vec<String>,
    period: Duration,
    trade_tx: TradeSender,
    snapshot_tx: mpsc::UnboundedSender<BookSnapshot>,
    shutdown: watch::Receiver<bool>,
}

impl RestPricePoller {
    pub fn new(
        client: ProviderRestClient,
        symbols: Vec<String>,
        trade_tx: TradeSender,
        snapshot_tx: mpsc::UnboundedSender<BookSnapshot>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            symbols,
            period: DEFAULT_PERIOD,
            trade_tx,
            snapshot_tx,
            shutdown,
        }
    }

    /// Poll until shutdown. Each cycle covers every symbol; one failing
    /// symbol never blocks the rest.
    pub async fn run(self) {
        info!(
            symbols = %self.symbols.join(","),
            period_secs = self.period.as_secs(),
            "REST price poller starting"
        );
        let mut rng = StdRng::from_entropy();
        let mut last_prices: HashMap<String, f64> = HashMap::new();
        let mut trades_emitted: u64 = 0;
        let mut ticker = tokio::time::interval(self.period);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            for symbol in &self.symbols {
                match self
                    .poll_symbol(symbol, &mut last_prices, &mut trades_emitted, &mut rng)
                    .await
                {
                    Ok(()) => {}
                    Err(e) => error!(symbol = %symbol, error = %e, "poll cycle failed"),
                }
            }
        }
        info!("REST price poller stopped");
    }

    async fn poll_symbol(
        &self,
        symbol: &str,
        last_prices: &mut HashMap<String, f64>,
        trades_emitted: &mut u64,
        rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        let ticker = symbols::provider_ticker(symbol);

        // Last trade is the precise source; previous aggregate backstops
        // it when the endpoint has nothing for the ticker.
        let (price, timestamp_ms) = match self.client.fetch_last_trade(&ticker).await {
            Ok(Some(last)) => (last.price, last.timestamp_ms),
            Ok(None) | Err(_) => match self.client.fetch_prev_close(&ticker).await? {
                Some(close) => (close, chrono::Utc::now().timestamp_millis()),
                None => return Ok(()),
            },
        };
        if price <= 0.0 {
            return Ok(());
        }

        // Emit only on movement; a flat poll cycle is not a trade.
        if last_prices.get(symbol).copied() == Some(price) {
            return Ok(());
        }
        last_prices.insert(symbol.to_string(), price);
        *trades_emitted += 1;

        let _ = self.trade_tx.send(Trade {
            symbol: symbol.to_string(),
            price,
            size: 1,
            timestamp_ms,
            venue: 1,
            conditions: Vec::new(),
        });

        let book = synthetic::poller_book(symbol, price, *trades_emitted, rng);
        let _ = self.snapshot_tx.send(book);
        Ok(())
    }
}
