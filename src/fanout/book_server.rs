// =============================================================================
// Book Fan-Out Server — L2 snapshots for the browser depth ladder
// =============================================================================
//
// Browsers connect to ws://localhost:<orderbook_port>/ and receive the
// symbols list plus {"type":"book",...} frames. Snapshot pushes are
// throttled to one broadcast per symbol per 100 ms; snapshots landing
// inside the quiet window only refresh the cache (most-recent-wins), and
// newly connecting or switching clients always get the cached state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

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
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};
use uuid::Uuid;

use crate::market_data::BookSnapshot;
use crate::symbols;

/// Minimum spacing between two broadcasts of the same symbol.
const THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Throttle gate
// ---------------------------------------------------------------------------

/// Per-symbol minimum-interval gate. Pure over a caller-supplied clock so
/// the window is testable without sleeping.
struct ThrottleGate {
    min_interval: Duration,
    last_sent: HashMap<String, Instant>,
}

impl ThrottleGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: HashMap::new(),
        }
    }

    /// True when a broadcast for `symbol` may go out at `now`; records the
    /// send time when permitted.
    fn permit(&mut self, symbol: &str, now: Instant) -> bool {
        match self.last_sent.get(symbol) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                self.last_sent.insert(symbol.to_string(), now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct BookClient {
    tx: mpsc::UnboundedSender<Message>,
    symbol: String,
}

/// WebSocket server pushing order-book snapshots with per-symbol
/// throttling and a last-snapshot cache for late joiners.
pub struct BookFanoutServer {
    symbols: Vec<String>,
    clients: RwLock<HashMap<Uuid, BookClient>>,
    cache: RwLock<HashMap<String, Value>>,
    throttle: Mutex<ThrottleGate>,
}

impl BookFanoutServer {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            clients: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            throttle: Mutex::new(ThrottleGate::new(THROTTLE_INTERVAL)),
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
            .with_context(|| format!("failed to bind book server on port {port}"))?;
        info!(port, "book fan-out server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .context("book server failed")?;
        info!("book fan-out server stopped");
        Ok(())
    }

    /// Accept one snapshot from an aggregator or generator. The cache is
    /// always refreshed; the broadcast happens only outside the symbol's
    /// quiet window.
    pub fn publish(&self, snapshot: &BookSnapshot) {
        let frame = book_frame(snapshot);
        let symbol = snapshot.symbol.clone();
        self.cache.write().insert(symbol.clone(), frame.clone());

        if !self.throttle.lock().permit(&symbol, Instant::now()) {
            return;
        }

        let text = frame.to_string();
        let clients = self.clients.read();
        for client in clients.values() {
            if client.symbol == symbol {
                let _ = client.tx.send(Message::Text(text.clone()));
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let client_id = Uuid::new_v4();
        let Some(default_symbol) = self.symbols.first().cloned() else {
            return;
        };

        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        self.clients.write().insert(
            client_id,
            BookClient {
                tx: tx.clone(),
                symbol: default_symbol.clone(),
            },
        );
        info!(client = %client_id, symbol = %default_symbol, "book client connected");

        let _ = tx.send(Message::Text(
            json!({ "type": "symbols", "symbols": self.symbols }).to_string(),
        ));
        if let Some(cached) = self.cache.read().get(&default_symbol) {
            let _ = tx.send(Message::Text(cached.to_string()));
        }

        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    self.handle_request(client_id, &tx, &request);
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        self.clients.write().remove(&client_id);
        writer.abort();
        info!(client = %client_id, "book client disconnected");
    }

    fn handle_request(
        &self,
        client_id: Uuid,
        tx: &mpsc::UnboundedSender<Message>,
        request: &Value,
    ) {
        if request.get("action").and_then(Value::as_str) != Some("subscribe") {
            return;
        }
        let Some(raw) = request.get("symbol").and_then(Value::as_str) else {
            return;
        };
        let symbol = symbols::normalize(raw);
        if !self.symbols.contains(&symbol) {
            debug!(symbol = %symbol, "book subscribe to unregistered symbol ignored");
            return;
        }

        if let Some(client) = self.clients.write().get_mut(&client_id) {
            client.symbol = symbol.clone();
        }

        match self.cache.read().get(&symbol) {
            Some(cached) => {
                let _ = tx.send(Message::Text(cached.to_string()));
            }
            None => {
                // Nothing seen yet for this symbol: clear the ladder the
                // client is still rendering for the previous one.
                let empty = book_frame(&BookSnapshot::empty(&symbol));
                let _ = tx.send(Message::Text(empty.to_string()));
            }
        }
        info!(client = %client_id, symbol = %symbol, "book client switched symbol");
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<BookFanoutServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| server.handle_socket(socket))
}

fn book_frame(snapshot: &BookSnapshot) -> Value {
    let mut frame = serde_json::to_value(snapshot).unwrap_or_default();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("type".to_string(), Value::from("book"));
    }
    frame
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_and_blocks_burst() {
        let mut gate = ThrottleGate::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert!(gate.permit("TSLA", t0));
        // 49 more snapshots inside the window: all silent.
        for i in 1..50 {
            assert!(!gate.permit("TSLA", t0 + Duration::from_millis(i * 2)));
        }
        // First snapshot after the window goes out.
        assert!(gate.permit("TSLA", t0 + Duration::from_millis(100)));
    }

    #[test]
    fn throttle_is_per_symbol() {
        let mut gate = ThrottleGate::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(gate.permit("TSLA", t0));
        assert!(gate.permit("AAPL", t0 + Duration::from_millis(1)));
        assert!(!gate.permit("TSLA", t0 + Duration::from_millis(2)));
    }

    #[test]
    fn cache_always_holds_latest_snapshot() {
        let server = BookFanoutServer::new(vec!["TSLA".to_string()]);

        // 50 snapshots in a burst; only the first clears the throttle but
        // the cache must end on the 50th payload.
        for i in 1..=50u64 {
            let mut snap = BookSnapshot::empty("TSLA");
            snap.updates = i;
            server.publish(&snap);
        }
        let cache = server.cache.read();
        let frame = cache.get("TSLA").expect("cached frame");
        assert_eq!(frame.get("updates").and_then(Value::as_u64), Some(50));
        assert_eq!(frame.get("type").and_then(Value::as_str), Some("book"));
    }

    #[test]
    fn book_frame_carries_wire_fields() {
        let frame = book_frame(&BookSnapshot::empty("AAPL"));
        assert_eq!(frame.get("symbol").and_then(Value::as_str), Some("AAPL"));
        assert_eq!(frame.get("best_bid").and_then(Value::as_f64), Some(0.0));
        assert!(frame.get("bids").and_then(Value::as_array).is_some_and(Vec::is_empty));
        assert!(frame.get("mid_price").is_some());
        assert!(frame.get("num_exchanges_bid").is_some());
    }
}
