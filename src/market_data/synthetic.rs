// =============================================================================
// Synthetic Books — generated depth for feeds that carry no real quotes
// =============================================================================
//
// Two generators share the snapshot shape of the real aggregator:
//   * `poller_book`  — crypto symbols served by the REST poller, which has
//     prices but no quote stream.
//   * `equity_closed_book` — equities while the venue is closed, seeded
//     from the last known price until real quotes take over.
//
// Both take a caller-provided rng so tests can pin the noise.
// =============================================================================

use rand::Rng;

use super::order_book::{BookLevel, BookSnapshot};

/// Venue ids sampled for closed-market equity levels (NYSE, NASDAQ, ...).
const EQUITY_VENUES: &[u32] = &[4, 7, 11, 12, 15, 19];

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// 15-level book around a REST-polled price. Spread is 0.01 % of the
/// price; sizes are small fractional lots growing with depth.
pub fn poller_book<R: Rng>(
    symbol: &str,
    price: f64,
    updates: u64,
    rng: &mut R,
) -> BookSnapshot {
    const LEVELS: usize = 15;

    let half_spread = price * 0.0001 / 2.0;
    let step = (price * 0.00005).max(0.01);
    let best_bid = round2(price - half_spread);
    let best_ask = round2(price + half_spread);

    let mut bids = Vec::with_capacity(LEVELS);
    let mut asks = Vec::with_capacity(LEVELS);
    let mut cum_bid = 0.0;
    let mut cum_ask = 0.0;

    for i in 0..LEVELS {
        let depth_mult = 1.0 + 0.3 * i as f64;

        let bid_size = round6(rng.gen_range(0.001..=0.5) * depth_mult);
        cum_bid += bid_size;
        bids.push(BookLevel {
            price: round2(best_bid - i as f64 * step),
            size: bid_size,
            cumulative: round6(cum_bid),
            venues: vec![100 + i as u32],
            synthetic: true,
        });

        let ask_size = round6(rng.gen_range(0.001..=0.5) * depth_mult);
        cum_ask += ask_size;
        asks.push(BookLevel {
            price: round2(best_ask + i as f64 * step),
            size: ask_size,
            cumulative: round6(cum_ask),
            venues: vec![200 + i as u32],
            synthetic: true,
        });
    }

    BookSnapshot {
        symbol: symbol.to_string(),
        bids,
        asks,
        best_bid,
        best_ask,
        spread: round4(best_ask - best_bid),
        mid_price: round2((best_bid + best_ask) / 2.0),
        updates,
        num_exchanges_bid: LEVELS,
        num_exchanges_ask: LEVELS,
    }
}

/// 20-level book for a closed-market equity: penny steps, institutional
/// lot sizes, a one-to-three-cent spread around the last known price.
pub fn equity_closed_book<R: Rng>(
    symbol: &str,
    price: f64,
    updates: u64,
    rng: &mut R,
) -> BookSnapshot {
    const LEVELS: usize = 20;
    const STEP: f64 = 0.01;

    let spread_cents = rng.gen_range(1.0..=3.0);
    let half_spread = spread_cents / 200.0;
    let best_bid = round2(price - half_spread);
    let mut best_ask = round2(price + half_spread);
    if best_ask <= best_bid {
        best_ask = best_bid + STEP;
    }

    let mut bids = Vec::with_capacity(LEVELS);
    let mut asks = Vec::with_capacity(LEVELS);
    let mut cum_bid = 0.0;
    let mut cum_ask = 0.0;

    for i in 0..LEVELS {
        let lot_mult = (1 + i / 3) as f64;

        let bid_size = rng.gen_range(100..=800) as f64 * lot_mult;
        cum_bid += bid_size;
        bids.push(BookLevel {
            price: round2(best_bid - i as f64 * STEP),
            size: bid_size,
            cumulative: cum_bid,
            venues: vec![EQUITY_VENUES[rng.gen_range(0..EQUITY_VENUES.len())]],
            synthetic: true,
        });

        let ask_size = rng.gen_range(100..=800) as f64 * lot_mult;
        cum_ask += ask_size;
        asks.push(BookLevel {
            price: round2(best_ask + i as f64 * STEP),
            size: ask_size,
            cumulative: cum_ask,
            venues: vec![EQUITY_VENUES[rng.gen_range(0..EQUITY_VENUES.len())]],
            synthetic: true,
        });
    }

    BookSnapshot {
        symbol: symbol.to_string(),
        bids,
        asks,
        best_bid,
        best_ask,
        spread: round4(best_ask - best_bid),
        mid_price: round2((best_bid + best_ask) / 2.0),
        updates,
        num_exchanges_bid: LEVELS,
        num_exchanges_ask: LEVELS,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn poller_book_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let snap = poller_book("BTCUSD", 68_000.0, 5, &mut rng);

        assert_eq!(snap.bids.len(), 15);
        assert_eq!(snap.asks.len(), 15);
        assert_eq!(snap.updates, 5);
        assert!(snap.best_ask > snap.best_bid);
        // Spread is ~0.01% of price.
        assert!((snap.spread - 6.8).abs() < 0.1);

        // Bids descend, asks ascend, all levels flagged synthetic.
        for pair in snap.bids.windows(2) {
            assert!(pair[1].price < pair[0].price);
        }
        for pair in snap.asks.windows(2) {
            assert!(pair[1].price > pair[0].price);
        }
        assert!(snap.bids.iter().all(|l| l.synthetic));
        assert!(snap.asks.iter().all(|l| l.synthetic));

        // Fractional crypto lots in (0, 0.5 * depth multiplier].
        for (i, level) in snap.bids.iter().enumerate() {
            assert!(level.size > 0.0);
            assert!(level.size <= 0.5 * (1.0 + 0.3 * i as f64) + 1e-9);
        }
    }

    #[test]
    fn poller_book_is_seed_deterministic() {
        let a = poller_book("ETHUSD", 3_500.0, 1, &mut ChaCha8Rng::seed_from_u64(9));
        let b = poller_book("ETHUSD", 3_500.0, 1, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn equity_closed_book_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let snap = equity_closed_book("AAPL", 189.50, 42, &mut rng);

        assert_eq!(snap.bids.len(), 20);
        assert_eq!(snap.asks.len(), 20);
        assert_eq!(snap.updates, 42);
        // One to three cents of spread, never inverted.
        assert!(snap.spread >= 0.01 - 1e-9);
        assert!(snap.spread <= 0.03 + 1e-9);
        assert!(snap.best_ask > snap.best_bid);

        // Lot sizes scale with depth and venues come from the fixed set.
        for (i, level) in snap.bids.iter().enumerate() {
            let lot_mult = (1 + i / 3) as f64;
            assert!(level.size >= 100.0 * lot_mult);
            assert!(level.size <= 800.0 * lot_mult);
            assert!(EQUITY_VENUES.contains(&level.venues[0]));
        }

        // Cumulative totals are monotone on both sides.
        for pair in snap.bids.windows(2) {
            assert!(pair[1].cumulative > pair[0].cumulative);
        }
        for pair in snap.asks.windows(2) {
            assert!(pair[1].cumulative > pair[0].cumulative);
        }
    }

    #[test]
    fn equity_spread_floor_holds_near_zero_prices() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let snap = equity_closed_book("PENNY", 0.004, 1, &mut rng);
        assert!(snap.best_ask > snap.best_bid);
    }
}
