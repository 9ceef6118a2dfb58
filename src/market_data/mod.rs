pub mod ohlc;
pub mod order_book;
pub mod replay;
pub mod synthetic;

// Re-export the aggregator types for convenient access
// (e.g. `use crate::market_data::OhlcAggregator`).
pub use ohlc::{Bar, OhlcAggregator};
pub use order_book::{BookLevel, BookSnapshot, OrderBookAggregator};
pub use replay::ReplayBuffer;

use serde::Serialize;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Normalized upstream events
// ---------------------------------------------------------------------------

/// A single trade print, normalized from the provider's wire form.
///
/// Field mapping from the raw record: `sym` → symbol (internal form),
/// `p` → price, `s` → size, `t` → timestamp_ms, `x` → venue,
/// `c` → conditions.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub size: u64,
    pub timestamp_ms: i64,
    /// Reporting venue id, 0 when unknown.
    pub venue: u32,
    /// Provider condition codes attached to the print.
    pub conditions: Vec<i64>,
}

/// A top-of-book quote from one venue, normalized from the provider's wire
/// form (`bp`/`bs`/`bx` bid side, `ap`/`as`/`ax` ask side). A side with
/// price 0 is absent.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub bid_price: f64,
    pub bid_size: u64,
    pub ask_price: f64,
    pub ask_size: u64,
    pub bid_venue: u32,
    pub ask_venue: u32,
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// Typed event channels
// ---------------------------------------------------------------------------
//
// Upstream sessions and the REST poller are producers; one worker task per
// channel fans events into the aggregators and fan-out servers. This keeps
// all mutation for a symbol on a single consumer task.

pub type TradeSender = mpsc::UnboundedSender<Trade>;
pub type TradeReceiver = mpsc::UnboundedReceiver<Trade>;
pub type QuoteSender = mpsc::UnboundedSender<Quote>;
pub type QuoteReceiver = mpsc::UnboundedReceiver<Quote>;

pub fn trade_channel() -> (TradeSender, TradeReceiver) {
    mpsc::unbounded_channel()
}

pub fn quote_channel() -> (QuoteSender, QuoteReceiver) {
    mpsc::unbounded_channel()
}
