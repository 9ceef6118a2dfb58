// =============================================================================
// Upstream Session — authenticated streaming connection to the provider
// =============================================================================
//
// One session per (endpoint, event kind): equity trades, equity quotes,
// fx trades, fx quotes. Lifecycle per connection:
//
//   DISCONNECTED → CONNECTING → AUTHENTICATING → SUBSCRIBING → STREAMING
//                                                       ↓
//                                        (CLOSING | FAILED) → DISCONNECTED
//
// Transport failures reconnect with exponential backoff, capped at 60 s.
// The attempt counter resets only after a connection has both streamed for
// ten seconds and delivered at least one message, so a provider that drops
// us immediately after connect cannot defeat the backoff. Auth rejection
// and cap exhaustion are terminal and reported to the Supervisor.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::{Quote, QuoteSender, Trade, TradeSender};
use crate::symbols;

/// Ping cadence on an open connection.
const HEARTBEAT: Duration = Duration::from_secs(30);
/// Grace after the heartbeat before an idle connection is declared dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// A connection must stream this long (with data) to reset the backoff.
const STABILITY_WINDOW: Duration = Duration::from_secs(10);
/// Reconnect attempts before the session gives up.
pub const DEFAULT_MAX_RECONNECTS: u32 = 50;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where a session delivers its normalized events. The sink also decides
/// which channel strings are subscribed.
pub enum EventSink {
    Trades(TradeSender),
    Quotes(QuoteSender),
}

impl EventSink {
    fn channel_for(&self, symbol: &str) -> String {
        match self {
            Self::Trades(_) => symbols::trade_channel(symbol),
            Self::Quotes(_) => symbols::quote_channel(symbol),
        }
    }
}

/// Terminal session outcomes the Supervisor must react to.
#[derive(Debug)]
pub enum SessionFatal {
    AuthRejected { session: String, message: String },
    ReconnectCapExceeded { session: String, attempts: u32 },
}

/// Lifecycle states, mirrored into logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Closing,
    Failed,
}

/// Hot subscription changes delivered to the running read loop.
enum SessionCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Clonable handle for mutating a live session's subscription set.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn subscribe(&self, symbol: &str) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::Subscribe(symbols::normalize(symbol)));
    }

    pub fn unsubscribe(&self, symbol: &str) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::Unsubscribe(symbols::normalize(symbol)));
    }
}

/// Marker error for credential rejection; callers downcast to tell it
/// apart from transport failures.
#[derive(Debug)]
pub struct AuthRejected(pub String);

impl std::fmt::Display for AuthRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "authentication rejected: {}", self.0)
    }
}

impl std::error::Error for AuthRejected {}

enum StreamEnd {
    /// stop() requested; do not reconnect.
    Stopped,
    /// Remote closed or went idle; reconnect applies.
    Disconnected,
}

// ---------------------------------------------------------------------------
// UpstreamSession
// ---------------------------------------------------------------------------

pub struct UpstreamSession {
    name: String,
    url: String,
    api_key: String,
    sink: EventSink,
    symbols: RwLock<Vec<String>>,
    max_reconnects: u32,

    state: RwLock<SessionState>,
    messages_received: AtomicU64,
    reconnect_count: AtomicU32,
    last_message_ms: AtomicI64,

    fatal_tx: mpsc::UnboundedSender<SessionFatal>,
    // The session keeps one sender alive so the command stream never ends.
    _cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    cmd_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionCommand>>,
    shutdown: watch::Receiver<bool>,
}

impl UpstreamSession {
    /// Build a session for `symbols` against `url`. `name` labels every
    /// log line and fatal report (e.g. "stocks-trades").
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: impl Into<String>,
        symbols: Vec<String>,
        sink: EventSink,
        fatal_tx: mpsc::UnboundedSender<SessionFatal>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            cmd_tx: cmd_tx.clone(),
        };
        let session = Arc::new(Self {
            name: name.into(),
            url: url.into(),
            api_key: api_key.into(),
            sink,
            symbols: RwLock::new(symbols),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            state: RwLock::new(SessionState::Disconnected),
            messages_received: AtomicU64::new(0),
            reconnect_count: AtomicU32::new(0),
            last_message_ms: AtomicI64::new(0),
            fatal_tx,
            _cmd_tx: cmd_tx,
            cmd_rx: tokio::sync::Mutex::new(cmd_rx),
            shutdown,
        });
        (session, handle)
    }

    // ── Metrics for the periodic stats task ─────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Seconds since the last received frame, if any frame arrived yet.
    pub fn last_message_age_secs(&self) -> Option<i64> {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some((chrono::Utc::now().timestamp_millis() - last) / 1000)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    // ── Main loop ───────────────────────────────────────────────────────

    /// Connect-stream-reconnect until stopped, the reconnect cap trips, or
    /// the credential is rejected.
    pub async fn run(self: Arc<Self>) {
        info!(session = %self.name, url = %self.url, "upstream session starting");
        let mut attempts: u32 = 0;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_stream(&mut attempts, &mut shutdown).await {
                Ok(StreamEnd::Stopped) => break,
                Ok(StreamEnd::Disconnected) => {
                    warn!(session = %self.name, "connection closed by remote");
                }
                Err(e) => {
                    if let Some(auth) = e.downcast_ref::<AuthRejected>() {
                        error!(session = %self.name, error = %auth, "credential rejected — not retrying");
                        self.set_state(SessionState::Failed);
                        let _ = self.fatal_tx.send(SessionFatal::AuthRejected {
                            session: self.name.clone(),
                            message: auth.0.clone(),
                        });
                        return;
                    }
                    warn!(session = %self.name, error = %e, "transport error");
                }
            }

            if *shutdown.borrow() {
                break;
            }

            attempts += 1;
            self.reconnect_count.store(attempts, Ordering::Relaxed);
            if attempts > self.max_reconnects {
                error!(
                    session = %self.name,
                    attempts,
                    "reconnect cap exceeded — session giving up"
                );
                self.set_state(SessionState::Failed);
                let _ = self.fatal_tx.send(SessionFatal::ReconnectCapExceeded {
                    session: self.name.clone(),
                    attempts,
                });
                return;
            }

            let wait = backoff_delay_secs(attempts);
            info!(
                session = %self.name,
                wait_secs = wait,
                attempt = attempts,
                max = self.max_reconnects,
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(SessionState::Disconnected);
        info!(session = %self.name, "upstream session stopped");
    }

    /// One full connection: welcome, auth, subscribe, stream.
    async fn connect_and_stream(
        &self,
        attempts: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd> {
        self.set_state(SessionState::Connecting);
        info!(session = %self.name, url = %self.url, "connecting");

        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("websocket connect failed")?;
        let (mut write, mut read) = ws_stream.split();
        let connected_at = Instant::now();
        let mut messages_this_conn: u64 = 0;

        // Welcome frame; content is ignored.
        match read.next().await {
            Some(Ok(frame)) => debug!(session = %self.name, frame = ?frame, "welcome frame"),
            Some(Err(e)) => return Err(e).context("error reading welcome frame"),
            None => return Ok(StreamEnd::Disconnected),
        }

        // ── Authenticate ────────────────────────────────────────────────
        self.set_state(SessionState::Authenticating);
        let auth = json!({ "action": "auth", "params": self.api_key }).to_string();
        write
            .send(Message::Text(auth))
            .await
            .context("failed to send auth frame")?;

        match read.next().await {
            Some(Ok(Message::Text(reply))) => self.check_auth_reply(&reply)?,
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e).context("error reading auth reply"),
            None => return Ok(StreamEnd::Disconnected),
        }
        info!(session = %self.name, "authenticated");

        // ── Subscribe the current symbol set ────────────────────────────
        self.set_state(SessionState::Subscribing);
        let params = self.subscription_params();
        if !params.is_empty() {
            let sub = json!({ "action": "subscribe", "params": params }).to_string();
            write
                .send(Message::Text(sub))
                .await
                .context("failed to send subscribe frame")?;
            info!(session = %self.name, channels = %params, "subscribed");
        }

        // ── Stream ──────────────────────────────────────────────────────
        self.set_state(SessionState::Streaming);
        let mut cmd_rx = self.cmd_rx.lock().await;
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_rx = Instant::now();
                            messages_this_conn += 1;
                            self.messages_received.fetch_add(1, Ordering::Relaxed);
                            self.last_message_ms
                                .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);

                            if stability_reset_due(*attempts, connected_at.elapsed(), messages_this_conn) {
                                info!(session = %self.name, "connection stable — resetting backoff");
                                *attempts = 0;
                                self.reconnect_count.store(0, Ordering::Relaxed);
                            }
                            self.handle_frame(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_rx = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_rx = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(StreamEnd::Disconnected);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e).context("websocket read error"),
                    }
                }
                cmd = cmd_rx.recv() => {
                    if let Some(cmd) = cmd {
                        self.apply_command(cmd, &mut write).await?;
                    }
                }
                _ = heartbeat.tick() => {
                    if last_rx.elapsed() > HEARTBEAT + PONG_TIMEOUT {
                        anyhow::bail!("connection idle past heartbeat + pong timeout");
                    }
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("failed to send heartbeat ping")?;
                }
                _ = shutdown.changed() => {
                    self.set_state(SessionState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamEnd::Stopped);
                }
            }
        }
    }

    /// Auth replies arrive as an array of status records; `auth_failed`
    /// anywhere in it is terminal.
    fn check_auth_reply(&self, reply: &str) -> Result<()> {
        let parsed: Value = match serde_json::from_str(reply) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %self.name, error = %e, "unparseable auth reply — continuing");
                return Ok(());
            }
        };
        if let Some(records) = parsed.as_array() {
            for record in records {
                match record.get("status").and_then(Value::as_str) {
                    Some("auth_failed") => {
                        let message = record
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("invalid API key")
                            .to_string();
                        return Err(AuthRejected(message).into());
                    }
                    Some("auth_success") => return Ok(()),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn subscription_params(&self) -> String {
        self.symbols
            .read()
            .iter()
            .map(|s| self.sink.channel_for(s))
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn apply_command<S>(&self, cmd: SessionCommand, write: &mut S) -> Result<()>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        match cmd {
            SessionCommand::Subscribe(symbol) => {
                {
                    let mut set = self.symbols.write();
                    if set.contains(&symbol) {
                        warn!(session = %self.name, symbol = %symbol, "already subscribed");
                        return Ok(());
                    }
                    set.push(symbol.clone());
                }
                let channel = self.sink.channel_for(&symbol);
                let frame = json!({ "action": "subscribe", "params": channel }).to_string();
                write
                    .send(Message::Text(frame))
                    .await
                    .context("failed to send dynamic subscribe")?;
                info!(session = %self.name, channel = %channel, "dynamic subscription added");
            }
            SessionCommand::Unsubscribe(symbol) => {
                {
                    let mut set = self.symbols.write();
                    let Some(pos) = set.iter().position(|s| s == &symbol) else {
                        warn!(session = %self.name, symbol = %symbol, "was not subscribed");
                        return Ok(());
                    };
                    set.remove(pos);
                }
                let channel = self.sink.channel_for(&symbol);
                let frame = json!({ "action": "unsubscribe", "params": channel }).to_string();
                write
                    .send(Message::Text(frame))
                    .await
                    .context("failed to send dynamic unsubscribe")?;
                info!(session = %self.name, channel = %channel, "dynamic subscription removed");
            }
        }
        Ok(())
    }

    /// Frames are JSON arrays of event records; non-arrays are wrapped.
    fn handle_frame(&self, text: &str) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %self.name, error = %e, "dropping unparseable frame");
                return;
            }
        };
        match parsed {
            Value::Array(records) => {
                for record in &records {
                    self.dispatch_record(record);
                }
            }
            record => self.dispatch_record(&record),
        }
    }

    fn dispatch_record(&self, record: &Value) {
        match record.get("ev").and_then(Value::as_str) {
            Some("T") | Some("XT") => {
                if let EventSink::Trades(tx) = &self.sink {
                    match parse_trade(record) {
                        Some(trade) => {
                            let _ = tx.send(trade);
                        }
                        None => warn!(session = %self.name, "dropping malformed trade record"),
                    }
                }
            }
            Some("Q") | Some("XQ") => {
                if let EventSink::Quotes(tx) = &self.sink {
                    match parse_quote(record) {
                        Some(quote) => {
                            let _ = tx.send(quote);
                        }
                        None => warn!(session = %self.name, "dropping malformed quote record"),
                    }
                }
            }
            Some("status") => {
                debug!(
                    session = %self.name,
                    message = record.get("message").and_then(|v| v.as_str()).unwrap_or(""),
                    "status record"
                );
            }
            other => {
                debug!(session = %self.name, event = ?other, "ignoring unhandled event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure pieces (unit-testable without a socket)
// ---------------------------------------------------------------------------

/// Backoff before reconnect attempt `attempt` (1-based): min(2^n, 60).
pub fn backoff_delay_secs(attempt: u32) -> u64 {
    match 1u64.checked_shl(attempt) {
        Some(delay) => delay.min(60),
        None => 60,
    }
}

/// The attempt counter resets once a connection has streamed for the
/// stability window and delivered at least one message.
fn stability_reset_due(attempts: u32, connected_for: Duration, messages: u64) -> bool {
    attempts > 0 && connected_for >= STABILITY_WINDOW && messages >= 1
}

/// Normalize one raw trade record. `sym` is required; numeric fields
/// default to zero like the rest of the pipeline expects.
fn parse_trade(record: &Value) -> Option<Trade> {
    let symbol = symbols::normalize(record.get("sym")?.as_str()?);
    Some(Trade {
        symbol,
        price: record.get("p").and_then(Value::as_f64).unwrap_or(0.0),
        size: record.get("s").and_then(Value::as_f64).unwrap_or(0.0) as u64,
        timestamp_ms: record.get("t").and_then(Value::as_i64).unwrap_or(0),
        venue: record.get("x").and_then(Value::as_u64).unwrap_or(0) as u32,
        conditions: record
            .get("c")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default(),
    })
}

/// Normalize one raw quote record. Either side may be absent (price 0).
fn parse_quote(record: &Value) -> Option<Quote> {
    let symbol = symbols::normalize(record.get("sym")?.as_str()?);
    Some(Quote {
        symbol,
        bid_price: record.get("bp").and_then(Value::as_f64).unwrap_or(0.0),
        bid_size: record.get("bs").and_then(Value::as_u64).unwrap_or(0),
        ask_price: record.get("ap").and_then(Value::as_f64).unwrap_or(0.0),
        ask_size: record.get("as").and_then(Value::as_u64).unwrap_or(0),
        bid_venue: record.get("bx").and_then(Value::as_u64).unwrap_or(0) as u32,
        ask_venue: record.get("ax").and_then(Value::as_u64).unwrap_or(0) as u32,
        timestamp_ms: record.get("t").and_then(Value::as_i64).unwrap_or(0),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let waits: Vec<u64> = (1..=8).map(backoff_delay_secs).collect();
        assert_eq!(waits, vec![2, 4, 8, 16, 32, 60, 60, 60]);
        // Large attempt counts never overflow the shift.
        assert_eq!(backoff_delay_secs(64), 60);
    }

    #[test]
    fn stability_reset_scenario() {
        // Four failures in a row walk the schedule up to 16 s.
        let mut attempts = 0;
        let waits: Vec<u64> = (0..4)
            .map(|_| {
                attempts += 1;
                backoff_delay_secs(attempts)
            })
            .collect();
        assert_eq!(waits, vec![2, 4, 8, 16]);

        // Fifth attempt succeeds and streams for 11 s with data: reset.
        assert!(stability_reset_due(attempts, Duration::from_secs(11), 5));
        attempts = 0;

        // The next failure starts the schedule over at 2 s.
        attempts += 1;
        assert_eq!(backoff_delay_secs(attempts), 2);
    }

    #[test]
    fn no_reset_without_data_or_time() {
        assert!(!stability_reset_due(3, Duration::from_secs(9), 100));
        assert!(!stability_reset_due(3, Duration::from_secs(30), 0));
        assert!(!stability_reset_due(0, Duration::from_secs(30), 100));
    }

    #[test]
    fn parse_trade_record() {
        let record = serde_json::json!({
            "ev": "T", "sym": "AAPL", "p": 189.43, "s": 250,
            "t": 1_700_000_000_123_i64, "x": 11, "c": [14, 37]
        });
        let trade = parse_trade(&record).expect("valid trade");
        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.price, 189.43);
        assert_eq!(trade.size, 250);
        assert_eq!(trade.timestamp_ms, 1_700_000_000_123);
        assert_eq!(trade.venue, 11);
        assert_eq!(trade.conditions, vec![14, 37]);
    }

    #[test]
    fn parse_trade_normalizes_crypto_symbols() {
        let record = serde_json::json!({
            "ev": "XT", "sym": "X:BTC-USD", "p": 68_000.5, "s": 1, "t": 1_700_000_000_000_i64
        });
        let trade = parse_trade(&record).expect("valid trade");
        assert_eq!(trade.symbol, "BTCUSD");
        assert_eq!(trade.venue, 0);
        assert!(trade.conditions.is_empty());
    }

    #[test]
    fn parse_quote_record() {
        let record = serde_json::json!({
            "ev": "Q", "sym": "AAPL", "bp": 189.40, "bs": 300, "ap": 189.42,
            "as": 200, "bx": 11, "ax": 12, "t": 1_700_000_000_500_i64
        });
        let quote = parse_quote(&record).expect("valid quote");
        assert_eq!(quote.bid_price, 189.40);
        assert_eq!(quote.ask_size, 200);
        assert_eq!(quote.bid_venue, 11);
        assert_eq!(quote.ask_venue, 12);
    }

    #[test]
    fn parse_quote_tolerates_one_sided_records() {
        let record = serde_json::json!({
            "ev": "Q", "sym": "AAPL", "bp": 189.40, "bs": 300, "bx": 11,
            "t": 1_700_000_000_500_i64
        });
        let quote = parse_quote(&record).expect("valid quote");
        assert_eq!(quote.ask_price, 0.0);
        assert_eq!(quote.ask_venue, 0);
    }

    #[test]
    fn handle_normalizes_symbols_into_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle { cmd_tx };

        handle.subscribe("x:btc-usd");
        handle.unsubscribe(" aapl ");

        match cmd_rx.try_recv().expect("subscribe queued") {
            SessionCommand::Subscribe(sym) => assert_eq!(sym, "BTCUSD"),
            SessionCommand::Unsubscribe(_) => panic!("expected subscribe first"),
        }
        match cmd_rx.try_recv().expect("unsubscribe queued") {
            SessionCommand::Unsubscribe(sym) => assert_eq!(sym, "AAPL"),
            SessionCommand::Subscribe(_) => panic!("expected unsubscribe second"),
        }
    }

    #[test]
    fn records_without_symbol_are_rejected() {
        let record = serde_json::json!({ "ev": "T", "p": 1.0 });
        assert!(parse_trade(&record).is_none());
        assert!(parse_quote(&record).is_none());
    }
}
