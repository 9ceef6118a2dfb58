// =============================================================================
// Tick Fan-Out Server — price stream for the browser chart
// =============================================================================
//
// Browsers connect to ws://localhost:<chart_port>/ and receive:
//   1. {"type":"symbols","symbols":[...]}
//   2. {"type":"init","symbol":S,"data":[{"time":t,"value":v},...]}
//   3. {"type":"session",...} and an informational {"type":"data_info",...}
//   4. {"type":"tick",...} in real time for the selected symbol
//
// Browser → server: {"action":"subscribe","symbol":S} switches the selected
// symbol; {"action":"set_timeframe","timeframe":T} reloads history from the
// provider REST API at the requested bar width.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use chrono_tz::America::New_York;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market_data::ReplayBuffer;
use crate::session_clock;
use crate::symbols::{self, AssetKind};
use crate::upstream::rest::{history_window_days, timespan_for, AggBar, ProviderRestClient};

/// Timeframe reloads are allowed more time than regular REST calls.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(15);
/// Bars requested per timeframe reload.
const RELOAD_LIMIT: u32 = 5_000;
/// Points sent per init frame, newest kept.
const INIT_POINT_CAP: usize = 500;
/// Default per-client timeframe: one-minute candles.
const DEFAULT_TIMEFRAME_SECS: u64 = 60;

struct TickClient {
    tx: mpsc::UnboundedSender<Message>,
    symbol: String,
    timeframe_secs: u64,
}

/// WebSocket server for price ticks with per-client symbol and timeframe
/// selection and an in-memory replay buffer per symbol.
pub struct TickFanoutServer {
    symbols: Vec<String>,
    rest: ProviderRestClient,
    clients: RwLock<HashMap<Uuid, TickClient>>,
    replay: RwLock<HashMap<String, ReplayBuffer>>,
}

impl TickFanoutServer {
    pub fn new(symbols: Vec<String>, rest: ProviderRestClient) -> Self {
        Self {
            symbols,
            rest,
            clients: RwLock::new(HashMap::new()),
            replay: RwLock::new(HashMap::new()),
        }
    }

    /// Bind and serve until the shutdown signal flips.
    pub async fn serve(self: Arc<Self>, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        let app = Router::new()
            .route("/", get(upgrade_handler))
            .layer(cors)
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind tick server on port {port}"))?;
        info!(port, "tick fan-out server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .context("tick server failed")?;
        info!("tick fan-out server stopped");
        Ok(())
    }

    // ── Ingest path ─────────────────────────────────────────────────────

    /// Seed one historical point without broadcasting (bootstrap path).
    pub fn seed_point(&self, symbol: &str, epoch_secs: i64, price: f64) {
        self.replay
            .write()
            .entry(symbol.to_string())
            .or_default()
            .record(epoch_secs, price);
    }

    /// Record a live trade and push it to every client watching the
    /// symbol. Off-hours equity prints are dropped so the chart timeline
    /// has no dead gaps.
    pub fn register_tick(&self, symbol: &str, price: f64, timestamp_ms: i64) {
        let epoch_secs = timestamp_ms.div_euclid(1000);
        if symbols::classify(symbol) == AssetKind::Equity
            && !session_clock::in_extended_hours(epoch_secs)
        {
            return;
        }

        self.replay
            .write()
            .entry(symbol.to_string())
            .or_default()
            .record(epoch_secs, price);

        let frame = json!({
            "type": "tick",
            "symbol": symbol,
            "time": epoch_secs,
            "value": price,
        });
        self.broadcast_to_symbol(symbol, &frame);
    }

    /// Latest replayed price for a symbol, if any history exists.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.replay
            .read()
            .get(symbol)
            .and_then(|buf| buf.latest())
            .map(|(_, price)| price)
    }

    /// Push the current session frame to every connected client.
    pub fn broadcast_session(&self) {
        let frame = session_frame();
        let clients = self.clients.read();
        for client in clients.values() {
            let _ = client.tx.send(Message::Text(frame.to_string()));
        }
    }

    fn broadcast_to_symbol(&self, symbol: &str, frame: &Value) {
        let text = frame.to_string();
        let clients = self.clients.read();
        for client in clients.values() {
            if client.symbol == symbol {
                let _ = client.tx.send(Message::Text(text.clone()));
            }
        }
    }

    // ── Per-connection protocol ─────────────────────────────────────────

    fn init_frame(&self, symbol: &str) -> Value {
        let replay = self.replay.read();
        let data: Vec<Value> = replay
            .get(symbol)
            .map(|buf| {
                buf.points()
                    .map(|(t, v)| json!({ "time": t, "value": v }))
                    .collect()
            })
            .unwrap_or_default();
        let count = data.len();
        json!({
            "type": "init",
            "symbol": symbol,
            "data": data,
            "source": "polygon_rest",
            "candles_loaded": count,
        })
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let client_id = Uuid::new_v4();
        let Some(default_symbol) = self.symbols.first().cloned() else {
            return;
        };

        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer half: one task funnels every outbound frame to the socket
        // so broadcasts and per-client replies share one ordered path.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        self.clients.write().insert(
            client_id,
            TickClient {
                tx: tx.clone(),
                symbol: default_symbol.clone(),
                timeframe_secs: DEFAULT_TIMEFRAME_SECS,
            },
        );
        info!(client = %client_id, symbol = %default_symbol, "chart client connected");

        let _ = tx.send(Message::Text(
            json!({ "type": "symbols", "symbols": self.symbols }).to_string(),
        ));
        let _ = tx.send(Message::Text(self.init_frame(&default_symbol).to_string()));
        let _ = tx.send(Message::Text(session_frame().to_string()));
        let _ = tx.send(Message::Text(
            json!({
                "type": "data_info",
                "source": "Polygon.io",
                "data_type": "live trades + REST history",
                "market_status": session_clock::current().to_string(),
            })
            .to_string(),
        ));

        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        // Bad client JSON: ignore, keep the connection.
                        continue;
                    };
                    self.handle_request(client_id, &tx, &request).await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        self.clients.write().remove(&client_id);
        writer.abort();
        info!(client = %client_id, "chart client disconnected");
    }

    async fn handle_request(
        &self,
        client_id: Uuid,
        tx: &mpsc::UnboundedSender<Message>,
        request: &Value,
    ) {
        match request.get("action").and_then(Value::as_str) {
            Some("subscribe") => {
                let Some(raw) = request.get("symbol").and_then(Value::as_str) else {
                    return;
                };
                let symbol = symbols::normalize(raw);
                if !self.symbols.contains(&symbol) {
                    debug!(symbol = %symbol, "subscribe to unregistered symbol ignored");
                    return;
                }
                if let Some(client) = self.clients.write().get_mut(&client_id) {
                    client.symbol = symbol.clone();
                }
                let _ = tx.send(Message::Text(self.init_frame(&symbol).to_string()));
                let _ = tx.send(Message::Text(session_frame().to_string()));
                info!(client = %client_id, symbol = %symbol, "chart client switched symbol");
            }
            Some("set_timeframe") => {
                let Some(timeframe) = request.get("timeframe").and_then(Value::as_u64) else {
                    return;
                };
                if timeframe == 0 {
                    return;
                }
                let symbol = {
                    let mut clients = self.clients.write();
                    let Some(client) = clients.get_mut(&client_id) else {
                        return;
                    };
                    client.timeframe_secs = timeframe;
                    client.symbol.clone()
                };
                info!(client = %client_id, symbol = %symbol, timeframe, "timeframe change");
                if let Err(e) = self.reload_history(tx, &symbol, timeframe).await {
                    warn!(symbol = %symbol, timeframe, error = %e, "timeframe reload failed");
                }
            }
            _ => {}
        }
    }

    /// Fetch ~500 bars at the requested width and replace the client's
    /// chart contents with a fresh init frame.
    async fn reload_history(
        &self,
        tx: &mpsc::UnboundedSender<Message>,
        symbol: &str,
        timeframe_secs: u64,
    ) -> Result<()> {
        let (multiplier, timespan) = timespan_for(timeframe_secs);
        let days = history_window_days(timeframe_secs);
        let today = Utc::now().with_timezone(&New_York).date_naive();
        let from = today - chrono::Days::new(days as u64);

        let ticker = symbols::provider_ticker(symbol);
        let bars = self
            .rest
            .fetch_range(
                &ticker,
                multiplier,
                timespan,
                from,
                today,
                RELOAD_LIMIT,
                RELOAD_TIMEOUT,
            )
            .await?;
        if bars.is_empty() {
            warn!(symbol = %symbol, timeframe = timeframe_secs, "no history for timeframe");
            return Ok(());
        }

        let is_equity = symbols::classify(symbol) == AssetKind::Equity;
        let points = expand_bars_to_points(&bars, is_equity);
        let count = points.len();
        let data: Vec<Value> = points
            .iter()
            .map(|(t, v)| json!({ "time": t, "value": v }))
            .collect();

        let _ = tx.send(Message::Text(
            json!({
                "type": "init",
                "symbol": symbol,
                "data": data,
                "timeframe": timeframe_secs,
                "source": "polygon_rest",
                "candles_loaded": count,
            })
            .to_string(),
        ));
        info!(symbol = %symbol, timeframe = timeframe_secs, points = count, "history reloaded");
        Ok(())
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<TickFanoutServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| server.handle_socket(socket))
}

fn session_frame() -> Value {
    let info = session_clock::info();
    let mut frame = serde_json::to_value(&info).unwrap_or_default();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("type".to_string(), Value::from("session"));
    }
    frame
}

/// Expand aggregate bars into four {time,value} points per bar (open,
/// high, low, close at the bar-start second), filter equity bars outside
/// extended hours, and keep the newest 500 points.
fn expand_bars_to_points(bars: &[AggBar], filter_equity_hours: bool) -> Vec<(i64, f64)> {
    let mut points = Vec::with_capacity(bars.len() * 4);
    for bar in bars {
        if bar.t == 0 || bar.c == 0.0 {
            continue;
        }
        let t = bar.t.div_euclid(1000);
        if filter_equity_hours && !session_clock::in_extended_hours(t) {
            continue;
        }
        points.push((t, bar.o));
        points.push((t, bar.h));
        points.push((t, bar.l));
        points.push((t, bar.c));
    }
    if points.len() > INIT_POINT_CAP {
        points.drain(..points.len() - INIT_POINT_CAP);
    }
    points
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(t_ms: i64, o: f64, h: f64, l: f64, c: f64) -> AggBar {
        AggBar {
            t: t_ms,
            o,
            h,
            l,
            c,
            v: 100.0,
        }
    }

    #[test]
    fn bars_expand_to_ohlc_point_quads() {
        // 2024-06-12 14:30 UTC = 10:30 ET, inside regular hours.
        let t_ms = 1_718_202_600_000_i64;
        let points = expand_bars_to_points(&[bar(t_ms, 10.0, 12.0, 9.0, 11.0)], true);
        let t = t_ms / 1000;
        assert_eq!(
            points,
            vec![(t, 10.0), (t, 12.0), (t, 9.0), (t, 11.0)],
            "open, high, low, close in that order at the same second"
        );
    }

    #[test]
    fn equity_bars_outside_extended_hours_are_dropped() {
        // 2024-06-12 06:00 UTC = 02:00 ET — overnight.
        let overnight_ms = 1_718_172_000_000_i64;
        let points = expand_bars_to_points(&[bar(overnight_ms, 1.0, 1.0, 1.0, 1.0)], true);
        assert!(points.is_empty());

        // Crypto keeps the same bar.
        let points = expand_bars_to_points(&[bar(overnight_ms, 1.0, 1.0, 1.0, 1.0)], false);
        assert_eq!(points.len(), 4);
    }

    #[test]
    fn zero_bars_are_skipped() {
        let points = expand_bars_to_points(&[bar(0, 1.0, 1.0, 1.0, 1.0), bar(1_000, 0.0, 0.0, 0.0, 0.0)], false);
        assert!(points.is_empty());
    }

    #[test]
    fn init_points_truncate_to_newest_500() {
        // 200 crypto bars → 800 points → newest 500 survive.
        let bars: Vec<AggBar> = (0..200)
            .map(|i| bar(1_000 * 60 * i as i64 + 60_000, 1.0, 2.0, 0.5, 1.5))
            .collect();
        let points = expand_bars_to_points(&bars, false);
        assert_eq!(points.len(), 500);
        // The tail of the expansion is intact: last point is the last close.
        assert_eq!(points.last().map(|(_, v)| *v), Some(1.5));
        // The oldest surviving point belongs to bar 75 (800 - 500 = 300
        // points dropped = 75 whole bars).
        assert_eq!(points[0].0, (60_000 + 75 * 60_000) / 1000);
    }
}
