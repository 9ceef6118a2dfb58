// =============================================================================
// OHLC Aggregator — time-bucketed candles built from raw trade prints
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::Trade;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV candle. In-progress until a trade lands in a later bucket,
/// then sealed and appended to the symbol's history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    /// Bucket start in epoch seconds, always a multiple of the interval.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub trade_count: u64,
}

// ---------------------------------------------------------------------------
// OhlcAggregator -- per-symbol bucket state plus closed-bar history
// ---------------------------------------------------------------------------

/// Builds fixed-interval candles from trades, one state machine per symbol.
///
/// A trade in the current bucket folds into the in-progress bar. A trade in
/// a strictly later bucket seals the bar and opens a fresh one. A trade in
/// an earlier bucket is dropped so closed bars are never mutated. Buckets
/// with no trades simply never exist; gaps are fine.
pub struct OhlcAggregator {
    interval_secs: i64,
    state: RwLock<HashMap<String, SymbolState>>,
}

struct SymbolState {
    current: Bar,
    history: Vec<Bar>,
}

impl OhlcAggregator {
    /// Create an aggregator with the given bucket width (60 s for the
    /// standard per-minute candles).
    pub fn new(interval_secs: i64) -> Self {
        assert!(interval_secs > 0, "bar interval must be positive");
        Self {
            interval_secs,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Bucket start for a millisecond timestamp.
    fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        let secs = timestamp_ms.div_euclid(1000);
        secs.div_euclid(self.interval_secs) * self.interval_secs
    }

    /// Fold one trade in. Returns the sealed bar when this trade closed a
    /// bucket. O(1) per trade.
    pub fn observe(&self, trade: &Trade) -> Option<Bar> {
        let bucket = self.bucket_start(trade.timestamp_ms);
        let mut state = self.state.write();

        match state.get_mut(&trade.symbol) {
            None => {
                state.insert(
                    trade.symbol.clone(),
                    SymbolState {
                        current: open_bar(trade, bucket),
                        history: Vec::new(),
                    },
                );
                None
            }
            Some(sym_state) => {
                if bucket < sym_state.current.bucket_start {
                    // Late print from an already-closed bucket.
                    return None;
                }
                if bucket == sym_state.current.bucket_start {
                    let bar = &mut sym_state.current;
                    bar.high = bar.high.max(trade.price);
                    bar.low = bar.low.min(trade.price);
                    bar.close = trade.price;
                    bar.volume += trade.size;
                    bar.trade_count += 1;
                    return None;
                }
                let sealed = std::mem::replace(&mut sym_state.current, open_bar(trade, bucket));
                sym_state.history.push(sealed.clone());
                Some(sealed)
            }
        }
    }

    /// Ordered closed-bar history for a symbol.
    pub fn history_for(&self, symbol: &str) -> Vec<Bar> {
        self.state
            .read()
            .get(symbol)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// The in-progress bar, if the symbol has traded at all.
    pub fn current_bar(&self, symbol: &str) -> Option<Bar> {
        self.state.read().get(symbol).map(|s| s.current.clone())
    }
}

fn open_bar(trade: &Trade, bucket_start: i64) -> Bar {
    Bar {
        symbol: trade.symbol.clone(),
        bucket_start,
        open: trade.price,
        high: trade.price,
        low: trade.price,
        close: trade.price,
        volume: trade.size,
        trade_count: 1,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, price: f64, size: u64, timestamp_ms: i64) -> Trade {
        Trade {
            symbol: symbol.into(),
            price,
            size,
            timestamp_ms,
            venue: 0,
            conditions: Vec::new(),
        }
    }

    #[test]
    fn minute_close_scenario() {
        let agg = OhlcAggregator::new(60);

        assert!(agg.observe(&trade("AAPL", 150.00, 10, 60_000)).is_none());
        assert!(agg.observe(&trade("AAPL", 151.00, 5, 65_000)).is_none());
        assert!(agg.observe(&trade("AAPL", 149.50, 7, 90_000)).is_none());

        let sealed = agg
            .observe(&trade("AAPL", 150.25, 3, 120_000))
            .expect("bucket 60 must close");

        assert_eq!(sealed.bucket_start, 60);
        assert_eq!(sealed.open, 150.00);
        assert_eq!(sealed.high, 151.00);
        assert_eq!(sealed.low, 149.50);
        assert_eq!(sealed.close, 149.50);
        assert_eq!(sealed.volume, 22);
        assert_eq!(sealed.trade_count, 3);

        // Bucket 120 stays in progress.
        let current = agg.current_bar("AAPL").expect("in-progress bar");
        assert_eq!(current.bucket_start, 120);
        assert_eq!(current.open, 150.25);
        assert_eq!(agg.history_for("AAPL").len(), 1);
    }

    #[test]
    fn bar_invariants_hold() {
        let agg = OhlcAggregator::new(60);
        let prices = [100.0, 103.5, 99.2, 101.0, 100.7];
        for (i, price) in prices.iter().enumerate() {
            agg.observe(&trade("TSLA", *price, 2, (i as i64) * 1_000));
        }
        let sealed = agg
            .observe(&trade("TSLA", 100.0, 1, 61_000))
            .expect("first minute closes");

        assert!(sealed.low <= sealed.open && sealed.open <= sealed.high);
        assert!(sealed.low <= sealed.close && sealed.close <= sealed.high);
        assert_eq!(sealed.volume, 10);
        assert_eq!(sealed.trade_count, 5);
        assert_eq!(sealed.low, 99.2);
        assert_eq!(sealed.high, 103.5);
    }

    #[test]
    fn same_price_refeed_is_idempotent_on_extremes() {
        let agg = OhlcAggregator::new(60);
        agg.observe(&trade("AAPL", 150.0, 1, 1_000));
        agg.observe(&trade("AAPL", 150.0, 1, 2_000));
        agg.observe(&trade("AAPL", 150.0, 1, 3_000));

        let bar = agg.current_bar("AAPL").expect("bar exists");
        assert_eq!(bar.low, 150.0);
        assert_eq!(bar.high, 150.0);
        assert_eq!(bar.trade_count, 3);
    }

    #[test]
    fn out_of_order_trades_are_dropped() {
        let agg = OhlcAggregator::new(60);
        agg.observe(&trade("AAPL", 150.0, 1, 120_000));
        // Older bucket: must not reopen or mutate anything.
        assert!(agg.observe(&trade("AAPL", 1.0, 99, 30_000)).is_none());

        let bar = agg.current_bar("AAPL").expect("bar exists");
        assert_eq!(bar.bucket_start, 120);
        assert_eq!(bar.low, 150.0);
        assert_eq!(bar.volume, 1);
        assert!(agg.history_for("AAPL").is_empty());
    }

    #[test]
    fn gaps_between_buckets_are_allowed() {
        let agg = OhlcAggregator::new(60);
        agg.observe(&trade("AAPL", 150.0, 1, 60_000));
        // Jump three buckets ahead; exactly one bar closes.
        let sealed = agg
            .observe(&trade("AAPL", 151.0, 1, 300_000))
            .expect("gap close");
        assert_eq!(sealed.bucket_start, 60);
        assert_eq!(agg.current_bar("AAPL").map(|b| b.bucket_start), Some(300));
        assert_eq!(agg.history_for("AAPL").len(), 1);
    }

    #[test]
    fn symbols_are_independent() {
        let agg = OhlcAggregator::new(60);
        agg.observe(&trade("AAPL", 150.0, 1, 60_000));
        agg.observe(&trade("TSLA", 700.0, 2, 60_000));
        agg.observe(&trade("AAPL", 151.0, 1, 120_000));

        assert_eq!(agg.history_for("AAPL").len(), 1);
        assert!(agg.history_for("TSLA").is_empty());
    }
}
