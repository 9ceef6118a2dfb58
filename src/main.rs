// =============================================================================
// tapecast — Real-Time Market-Data Fan-Out Server
// =============================================================================
//
// Upstream trade and quote feeds come in over the provider's WebSocket
// (REST polling stands in where a feed is unavailable); per-symbol OHLC
// and L2 book state is derived in-process; browsers consume the result
// over two local WebSocket ports, one for price ticks and one for book
// snapshots.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod fanout;
mod market_data;
mod session_clock;
mod symbols;
mod upstream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::fanout::{BookFanoutServer, TickFanoutServer};
use crate::market_data::{synthetic, BookSnapshot, OhlcAggregator, OrderBookAggregator};
use crate::upstream::poller::RestPricePoller;
use crate::upstream::session::{EventSink, SessionFatal, UpstreamSession};
use crate::upstream::{history, ProviderRestClient};

/// Exit codes: 0 clean, 1 configuration missing, 2 auth fatal,
/// 3 reconnect cap exceeded.
const EXIT_CONFIG: i32 = 1;
const EXIT_AUTH: i32 = 2;
const EXIT_RECONNECT_CAP: i32 = 3;

#[tokio::main]
async fn main() {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        tapecast — market-data fan-out starting up       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };
    info!(config = %settings.summary(), "configuration loaded");

    let (equities, cryptos, forex) = symbols::partition(&settings.symbols);
    let all_symbols: Vec<String> = settings
        .symbols
        .iter()
        .map(|s| symbols::normalize(s))
        .collect();
    info!(
        equities = %equities.join(","),
        cryptos = %cryptos.join(","),
        forex = %forex.join(","),
        "symbols classified"
    );

    let session = session_clock::info();
    info!(session = %session.session, time_et = %session.time_et, "venue session at startup");

    // ── 2. Shared components & channels ──────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (trade_tx, mut trade_rx) = market_data::trade_channel();
    let (quote_tx, mut quote_rx) = market_data::quote_channel();
    let (snapshot_tx, mut snapshot_rx) = mpsc::unbounded_channel::<BookSnapshot>();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<SessionFatal>();

    let rest = ProviderRestClient::new(&settings.api_key);
    let tick_server = Arc::new(TickFanoutServer::new(all_symbols.clone(), rest.clone()));
    let book_server = Arc::new(BookFanoutServer::new(all_symbols.clone()));
    let ohlc = Arc::new(OhlcAggregator::new(60));
    let book_agg = Arc::new(OrderBookAggregator::new());
    let last_prices = Arc::new(RwLock::new(HashMap::<String, f64>::new()));
    let trades_seen = Arc::new(AtomicU64::new(0));
    let quotes_seen = Arc::new(AtomicU64::new(0));

    // ── 3. Fan-out servers ───────────────────────────────────────────────
    {
        let server = tick_server.clone();
        let rx = shutdown_rx.clone();
        let port = settings.chart_port;
        tokio::spawn(async move {
            if let Err(e) = server.serve(port, rx).await {
                error!(error = %e, "tick server exited with error");
            }
        });
    }
    {
        let server = book_server.clone();
        let rx = shutdown_rx.clone();
        let port = settings.orderbook_port;
        tokio::spawn(async move {
            if let Err(e) = server.serve(port, rx).await {
                error!(error = %e, "book server exited with error");
            }
        });
    }

    // ── 4. Historical bootstrap (before the live feeds attach) ───────────
    tokio::select! {
        seeded = history::bootstrap_history(&rest, &all_symbols, &tick_server) => {
            info!(symbols = seeded.len(), "historical bootstrap complete");
            *last_prices.write() = seeded;
        }
        _ = shutdown_signal() => {
            warn!("shutdown during historical bootstrap — exiting");
            let _ = shutdown_tx.send(true);
            std::process::exit(0);
        }
    }

    // ── 5. Upstream sessions & poller ────────────────────────────────────
    let mut sessions: Vec<Arc<UpstreamSession>> = Vec::new();

    let mut spawn_session = |name: &str, url: &str, syms: Vec<String>, sink: EventSink| {
        let (session, _handle) = UpstreamSession::new(
            name,
            url,
            settings.api_key.clone(),
            syms,
            sink,
            fatal_tx.clone(),
            shutdown_rx.clone(),
        );
        sessions.push(session.clone());
        tokio::spawn(session.run());
    };

    if !equities.is_empty() {
        spawn_session(
            "stocks-trades",
            symbols::WS_URL_STOCKS,
            equities.clone(),
            EventSink::Trades(trade_tx.clone()),
        );
        spawn_session(
            "stocks-quotes",
            symbols::WS_URL_STOCKS,
            equities.clone(),
            EventSink::Quotes(quote_tx.clone()),
        );
    }
    if !forex.is_empty() {
        spawn_session(
            "forex-trades",
            symbols::WS_URL_FOREX,
            forex.clone(),
            EventSink::Trades(trade_tx.clone()),
        );
        spawn_session(
            "forex-quotes",
            symbols::WS_URL_FOREX,
            forex.clone(),
            EventSink::Quotes(quote_tx.clone()),
        );
    }
    if !cryptos.is_empty() {
        // The streaming crypto feed is plan-gated; REST polling emulates it.
        let poller = RestPricePoller::new(
            rest.clone(),
            cryptos.clone(),
            trade_tx.clone(),
            snapshot_tx.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(poller.run());
    }
    info!(sessions = sessions.len(), "upstream feeds launched");

    // ── 6. Worker tasks: trades, quotes, snapshots ───────────────────────
    {
        let ohlc = ohlc.clone();
        let tick_server = tick_server.clone();
        let last_prices = last_prices.clone();
        let trades_seen = trades_seen.clone();
        tokio::spawn(async move {
            while let Some(trade) = trade_rx.recv().await {
                trades_seen.fetch_add(1, Ordering::Relaxed);
                last_prices.write().insert(trade.symbol.clone(), trade.price);
                if let Some(bar) = ohlc.observe(&trade) {
                    info!(
                        symbol = %bar.symbol,
                        open = bar.open,
                        high = bar.high,
                        low = bar.low,
                        close = bar.close,
                        volume = bar.volume,
                        "bar closed"
                    );
                }
                tick_server.register_tick(&trade.symbol, trade.price, trade.timestamp_ms);
            }
        });
    }
    {
        let book_agg = book_agg.clone();
        let snapshot_tx = snapshot_tx.clone();
        let quotes_seen = quotes_seen.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            while let Some(quote) = quote_rx.recv().await {
                quotes_seen.fetch_add(1, Ordering::Relaxed);
                if book_agg.apply_quote(&quote) {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let snapshot = book_agg.snapshot_for(&quote.symbol, now_ms, &mut rng);
                    let _ = snapshot_tx.send(snapshot);
                }
            }
        });
    }
    {
        let book_server = book_server.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = snapshot_rx.recv().await {
                book_server.publish(&snapshot);
            }
        });
    }

    // ── 7. Periodic stats + session broadcast (every 30 s) ───────────────
    {
        let tick_server = tick_server.clone();
        let sessions = sessions.clone();
        let trades_seen = trades_seen.clone();
        let quotes_seen = quotes_seen.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut prev_session = session_clock::current();
            let mut prev_trades: u64 = 0;
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let total_trades = trades_seen.load(Ordering::Relaxed);
                let tps = (total_trades - prev_trades) as f64 / 30.0;
                prev_trades = total_trades;

                let current = session_clock::current();
                info!(
                    trades = total_trades,
                    quotes = quotes_seen.load(Ordering::Relaxed),
                    trades_per_sec = tps,
                    session = %current,
                    "stats"
                );
                for session in &sessions {
                    info!(
                        session = %session.name(),
                        state = ?session.state(),
                        messages = session.messages_received(),
                        reconnects = session.reconnects(),
                        last_message_age_secs = ?session.last_message_age_secs(),
                        "session stats"
                    );
                }
                if current != prev_session {
                    info!(from = %prev_session, to = %current, "venue session changed");
                    prev_session = current;
                }
                tick_server.broadcast_session();
            }
        });
    }

    // ── 8. Synthetic closed-market books for equities (every 5 s) ────────
    if !equities.is_empty() {
        let last_prices = last_prices.clone();
        let snapshot_tx = snapshot_tx.clone();
        let equities = equities.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut counter: u64 = 0;
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                // Real quote streams own the book whenever the venue is open.
                if session_clock::is_open() {
                    continue;
                }
                for symbol in &equities {
                    let price = last_prices.read().get(symbol).copied().unwrap_or(0.0);
                    if price <= 0.0 {
                        continue;
                    }
                    counter += 1;
                    let book = synthetic::equity_closed_book(symbol, price, counter, &mut rng);
                    let _ = snapshot_tx.send(book);
                }
            }
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 9. Supervision: signals and fatal session outcomes ───────────────
    let mut reconnect_cap_tripped = false;
    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                warn!("shutdown signal received — stopping gracefully");
                break;
            }
            fatal = fatal_rx.recv() => match fatal {
                Some(SessionFatal::AuthRejected { session, message }) => {
                    error!(session = %session, message = %message, "credential rejected — shutting down");
                    let _ = shutdown_tx.send(true);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    std::process::exit(EXIT_AUTH);
                }
                Some(SessionFatal::ReconnectCapExceeded { session, attempts }) => {
                    // The rest of the engine keeps serving; the exit code
                    // remembers the loss.
                    error!(
                        session = %session,
                        attempts,
                        "session exhausted its reconnect cap — continuing without it"
                    );
                    reconnect_cap_tripped = true;
                }
                None => {}
            }
        }
    }

    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("tapecast shut down complete");
    if reconnect_cap_tripped {
        std::process::exit(EXIT_RECONNECT_CAP);
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
