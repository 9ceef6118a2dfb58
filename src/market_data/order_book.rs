// =============================================================================
// Order Book Aggregator — per-venue L2 store with merged depth snapshots
// =============================================================================
//
// Each venue reports its best bid/ask through the quote feed. Aggregating
// venues yields a multi-level book per symbol. Snapshots exclude venue
// entries older than the staleness window (entries are filtered, not
// deleted) and pad the real levels with flagged synthetic depth so the
// browser ladder stays visually continuous.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;

use super::Quote;

/// Venue entries older than this are excluded from snapshots.
const DEFAULT_STALE_MS: i64 = 30_000;

/// Display price steps are snapped up to the next value on this ladder.
const STEP_LADDER: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.10, 0.20, 0.50, 1.0, 2.0, 5.0,
    10.0, 20.0, 50.0,
];

/// Synthetic levels inserted per gap / appended per side, at most.
const MAX_SYNTHETIC_PER_GAP: usize = 60;
const MAX_EXTRAPOLATED: usize = 60;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One price level of a merged snapshot. Field names follow the book wire
/// format consumed by the browser ladder.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BookLevel {
    #[serde(rename = "precio")]
    pub price: f64,
    #[serde(rename = "tamano")]
    pub size: f64,
    #[serde(rename = "acumulado")]
    pub cumulative: f64,
    #[serde(rename = "exchanges")]
    pub venues: Vec<u32>,
    /// True for padding levels with no underlying venue quote.
    #[serde(rename = "interpolado", skip_serializing_if = "is_false")]
    pub synthetic: bool,
}

fn is_false(flag: &bool) -> bool {
    !flag
}

/// Merged book snapshot for one symbol: real levels, synthetic padding,
/// inside prices, and telemetry counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub mid_price: f64,
    pub updates: u64,
    /// Venue counts from raw storage, unfiltered, for telemetry.
    pub num_exchanges_bid: usize,
    pub num_exchanges_ask: usize,
}

impl BookSnapshot {
    /// Empty book for a symbol with no venue state.
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            best_bid: 0.0,
            best_ask: 0.0,
            spread: 0.0,
            mid_price: 0.0,
            updates: 0,
            num_exchanges_bid: 0,
            num_exchanges_ask: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// (price, size, last-update-ms) as reported by one venue for one side.
#[derive(Debug, Clone, Copy, PartialEq)]
struct VenueEntry {
    price: f64,
    size: u64,
    updated_ms: i64,
}

#[derive(Default)]
struct SymbolBook {
    bids: HashMap<u32, VenueEntry>,
    asks: HashMap<u32, VenueEntry>,
    updates: u64,
}

/// Aggregates per-venue top-of-book quotes into L2 books, one per symbol.
pub struct OrderBookAggregator {
    books: RwLock<HashMap<String, SymbolBook>>,
    stale_ms: i64,
    /// 0 = unlimited levels per side.
    max_levels: usize,
}

impl OrderBookAggregator {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_STALE_MS, 0)
    }

    pub fn with_limits(stale_ms: i64, max_levels: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            stale_ms,
            max_levels,
        }
    }

    /// Apply one quote. A side participates when its price is positive and
    /// its venue id is known. Returns true when any venue entry actually
    /// changed; identical (price, size) re-reports are idempotent.
    pub fn apply_quote(&self, quote: &Quote) -> bool {
        let mut books = self.books.write();
        let book = books.entry(quote.symbol.clone()).or_default();
        let mut changed = false;

        if quote.bid_price > 0.0 && quote.bid_venue > 0 {
            changed |= upsert(
                &mut book.bids,
                quote.bid_venue,
                quote.bid_price,
                quote.bid_size,
                quote.timestamp_ms,
            );
        }
        if quote.ask_price > 0.0 && quote.ask_venue > 0 {
            changed |= upsert(
                &mut book.asks,
                quote.ask_venue,
                quote.ask_price,
                quote.ask_size,
                quote.timestamp_ms,
            );
        }

        if changed {
            book.updates += 1;
        }
        changed
    }

    /// Build the merged snapshot for a symbol at `now_ms`. Pure with
    /// respect to stored state; the rng drives only the extrapolation
    /// noise, so tests inject a seeded generator.
    pub fn snapshot_for<R: Rng>(&self, symbol: &str, now_ms: i64, rng: &mut R) -> BookSnapshot {
        let books = self.books.read();
        let Some(book) = books.get(symbol) else {
            return BookSnapshot::empty(symbol);
        };
        let cutoff = now_ms - self.stale_ms;

        let mut bids = merge_side(&book.bids, cutoff, Side::Bid);
        let mut asks = merge_side(&book.asks, cutoff, Side::Ask);

        let best_bid = bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask = asks.first().map(|l| l.price).unwrap_or(0.0);

        let step = display_step(best_bid, best_ask);
        interpolate(&mut bids, step, Side::Bid);
        interpolate(&mut asks, step, Side::Ask);
        extrapolate(&mut bids, step, Side::Bid, rng);
        extrapolate(&mut asks, step, Side::Ask, rng);

        if self.max_levels > 0 {
            bids.truncate(self.max_levels);
            asks.truncate(self.max_levels);
        }

        accumulate(&mut bids);
        accumulate(&mut asks);

        let (spread, mid) = if best_bid > 0.0 && best_ask > 0.0 {
            (round6(best_ask - best_bid), round6((best_bid + best_ask) / 2.0))
        } else {
            (0.0, 0.0)
        };

        BookSnapshot {
            symbol: symbol.to_string(),
            bids,
            asks,
            best_bid,
            best_ask,
            spread,
            mid_price: mid,
            updates: book.updates,
            num_exchanges_bid: book.bids.len(),
            num_exchanges_ask: book.asks.len(),
        }
    }
}

impl Default for OrderBookAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert(
    side: &mut HashMap<u32, VenueEntry>,
    venue: u32,
    price: f64,
    size: u64,
    timestamp_ms: i64,
) -> bool {
    let entry = VenueEntry {
        price,
        size,
        updated_ms: timestamp_ms,
    };
    match side.get(&venue) {
        Some(prev) if prev.price == price && prev.size == size => false,
        _ => {
            side.insert(venue, entry);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot construction
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Bid,
    Ask,
}

/// Group fresh venue entries by price, best price first.
fn merge_side(entries: &HashMap<u32, VenueEntry>, cutoff: i64, side: Side) -> Vec<BookLevel> {
    // BTreeMap keyed on price bits keeps price grouping exact and ordered.
    let mut by_price: BTreeMap<u64, (f64, f64, Vec<u32>)> = BTreeMap::new();
    for (venue, entry) in entries {
        if entry.updated_ms < cutoff {
            continue;
        }
        let slot = by_price
            .entry(entry.price.to_bits())
            .or_insert((entry.price, 0.0, Vec::new()));
        slot.1 += entry.size as f64;
        slot.2.push(*venue);
    }

    let mut levels: Vec<BookLevel> = by_price
        .into_values()
        .map(|(price, size, mut venues)| {
            venues.sort_unstable();
            BookLevel {
                price,
                size,
                cumulative: 0.0,
                venues,
                synthetic: false,
            }
        })
        .collect();

    levels.sort_by(|a, b| match side {
        Side::Bid => b.price.total_cmp(&a.price),
        Side::Ask => a.price.total_cmp(&b.price),
    });
    levels
}

/// Display step from a reference price: 0.04 % of the inside, snapped up
/// to the nice-number ladder.
fn display_step(best_bid: f64, best_ask: f64) -> f64 {
    let reference = if best_bid > 0.0 {
        best_bid
    } else if best_ask > 0.0 {
        best_ask
    } else {
        100.0
    };
    let raw = reference * 0.0004;
    for candidate in STEP_LADDER {
        if *candidate >= raw {
            return *candidate;
        }
    }
    *STEP_LADDER.last().expect("ladder is non-empty")
}

/// Round to the nearest multiple of `step`, then to 6 decimal places.
fn snap(price: f64, step: f64) -> f64 {
    round6((price / step).round() * step)
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Insert synthetic levels between each pair of adjacent real levels,
/// spaced by `step`. Sizes follow a hump that peaks mid-gap and tapers
/// toward both real neighbours.
fn interpolate(levels: &mut Vec<BookLevel>, step: f64, side: Side) {
    if levels.len() < 2 {
        return;
    }
    let mut filled: Vec<BookLevel> = Vec::with_capacity(levels.len());
    for pair in levels.windows(2) {
        let (inner, outer) = (&pair[0], &pair[1]);
        filled.push(inner.clone());

        let gap = (inner.price - outer.price).abs();
        let slots = ((gap / step).floor() as usize)
            .saturating_sub(1)
            .min(MAX_SYNTHETIC_PER_GAP);
        for k in 1..=slots {
            let price = match side {
                Side::Bid => inner.price - k as f64 * step,
                Side::Ask => inner.price + k as f64 * step,
            };
            let price = snap(price, step);
            // Past the outer neighbour after snapping: stop this gap.
            let beyond = match side {
                Side::Bid => price <= outer.price,
                Side::Ask => price >= outer.price,
            };
            if beyond {
                break;
            }
            let t = k as f64 / (slots as f64 + 1.0);
            let shape = 0.3 + 0.7 * (std::f64::consts::PI * t).sin();
            let avg = (inner.size + outer.size) / 2.0;
            let size = (avg * shape * 0.4).floor().max(1.0);
            filled.push(BookLevel {
                price,
                size,
                cumulative: 0.0,
                venues: Vec::new(),
                synthetic: true,
            });
        }
    }
    filled.push(levels.last().expect("len >= 2").clone());
    *levels = filled;
}

/// Append decaying synthetic depth beyond the outermost real level.
fn extrapolate<R: Rng>(levels: &mut Vec<BookLevel>, step: f64, side: Side, rng: &mut R) {
    let real: Vec<&BookLevel> = levels.iter().filter(|l| !l.synthetic).collect();
    let Some(last) = real.last() else {
        return;
    };
    let mut size = if real.len() >= 2 {
        (real[real.len() - 2].size + last.size) / 2.0
    } else {
        last.size
    };
    let mut price = last.price;

    for _ in 0..MAX_EXTRAPOLATED {
        price = match side {
            Side::Bid => snap(price - step, step),
            Side::Ask => snap(price + step, step),
        };
        if side == Side::Bid && price <= 0.0 {
            break;
        }
        size *= 0.85;
        size *= rng.gen_range(0.8..=1.2);
        let level_size = size.max(1.0);
        levels.push(BookLevel {
            price,
            size: level_size,
            cumulative: 0.0,
            venues: Vec::new(),
            synthetic: true,
        });
    }
}

/// Cumulative sizes walking outward from the inside.
fn accumulate(levels: &mut [BookLevel]) {
    let mut total = 0.0;
    for level in levels {
        total += level.size;
        level.cumulative = round6(total);
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

    fn quote(
        symbol: &str,
        bp: f64,
        bs: u64,
        bx: u32,
        ap: f64,
        asz: u64,
        ax: u32,
        t: i64,
    ) -> Quote {
        Quote {
            symbol: symbol.into(),
            bid_price: bp,
            bid_size: bs,
            ask_price: ap,
            ask_size: asz,
            bid_venue: bx,
            ask_venue: ax,
            timestamp_ms: t,
        }
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    fn real_levels(levels: &[BookLevel]) -> Vec<&BookLevel> {
        levels.iter().filter(|l| !l.synthetic).collect()
    }

    #[test]
    fn merge_across_venues_at_same_price() {
        let agg = OrderBookAggregator::new();
        let t = 1_000_000;
        assert!(agg.apply_quote(&quote("AAPL", 100.00, 100, 11, 100.02, 200, 12, t)));
        assert!(agg.apply_quote(&quote("AAPL", 100.00, 50, 12, 0.0, 0, 0, t + 100)));

        let snap = agg.snapshot_for("AAPL", t + 200, &mut rng());
        assert_eq!(snap.best_bid, 100.00);
        assert_eq!(snap.best_ask, 100.02);
        assert_eq!(snap.spread, 0.02);

        let bids = real_levels(&snap.bids);
        assert_eq!(bids[0].size, 150.0);
        assert_eq!(bids[0].venues, vec![11, 12]);

        let asks = real_levels(&snap.asks);
        assert_eq!(asks[0].size, 200.0);
        assert_eq!(asks[0].venues, vec![12]);
    }

    #[test]
    fn identical_requote_is_idempotent() {
        let agg = OrderBookAggregator::new();
        let q = quote("AAPL", 100.0, 100, 11, 100.02, 200, 12, 1_000);
        assert!(agg.apply_quote(&q));
        assert!(!agg.apply_quote(&q), "unchanged (price,size) must not count");

        let snap = agg.snapshot_for("AAPL", 2_000, &mut rng());
        assert_eq!(snap.updates, 1);
    }

    #[test]
    fn stale_entries_filtered_but_not_deleted() {
        let agg = OrderBookAggregator::new();
        agg.apply_quote(&quote("AAPL", 100.0, 100, 11, 0.0, 0, 0, 0));
        agg.apply_quote(&quote("AAPL", 99.5, 40, 12, 0.0, 0, 0, 60_000));

        // Venue 11's entry is 60 s old at now=60s: outside the 30 s window.
        let snap = agg.snapshot_for("AAPL", 60_000, &mut rng());
        let bids = real_levels(&snap.bids);
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, 99.5);
        // Storage still remembers both venues for telemetry.
        assert_eq!(snap.num_exchanges_bid, 2);
    }

    #[test]
    fn crossed_books_are_preserved() {
        let agg = OrderBookAggregator::new();
        agg.apply_quote(&quote("AAPL", 100.10, 10, 11, 0.0, 0, 0, 1_000));
        agg.apply_quote(&quote("AAPL", 0.0, 0, 0, 100.05, 10, 12, 1_000));

        let snap = agg.snapshot_for("AAPL", 1_500, &mut rng());
        assert_eq!(snap.best_bid, 100.10);
        assert_eq!(snap.best_ask, 100.05);
        // Crossing must stay observable; snapshot does not filter it.
        assert!(snap.best_ask < snap.best_bid);
        assert_eq!(snap.spread, round6(100.05 - 100.10));
    }

    #[test]
    fn snapshot_is_deterministic_under_a_seed() {
        let agg = OrderBookAggregator::new();
        agg.apply_quote(&quote("TSLA", 250.00, 100, 11, 250.40, 80, 12, 1_000));
        agg.apply_quote(&quote("TSLA", 249.50, 60, 4, 250.90, 70, 7, 1_000));

        let a = agg.snapshot_for("TSLA", 2_000, &mut ChaCha8Rng::seed_from_u64(42));
        let b = agg.snapshot_for("TSLA", 2_000, &mut ChaCha8Rng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn interpolation_fills_gaps_with_flagged_levels() {
        let agg = OrderBookAggregator::new();
        // Step for a ~250 reference: 250 * 0.0004 = 0.1 exactly.
        agg.apply_quote(&quote("TSLA", 250.00, 100, 11, 251.00, 80, 12, 1_000));
        agg.apply_quote(&quote("TSLA", 249.00, 60, 4, 252.00, 70, 7, 1_000));

        let snap = agg.snapshot_for("TSLA", 2_000, &mut rng());
        // 1.0 of gap at step 0.1 → 9 synthetic levels between the two bids.
        let between: Vec<&BookLevel> = snap
            .bids
            .iter()
            .filter(|l| l.synthetic && l.price < 250.0 && l.price > 249.0)
            .collect();
        assert_eq!(between.len(), 9);
        assert!(between.iter().all(|l| l.size >= 1.0));
        assert!(between.iter().all(|l| l.venues.is_empty()));

        // Mid-gap sizes exceed edge sizes (the hump shape).
        let first = between.first().expect("nine levels").size;
        let middle = between[between.len() / 2].size;
        assert!(middle >= first);
    }

    #[test]
    fn extrapolation_appends_decaying_depth() {
        let agg = OrderBookAggregator::new();
        agg.apply_quote(&quote("AAPL", 100.00, 500, 11, 100.05, 400, 12, 1_000));

        let snap = agg.snapshot_for("AAPL", 2_000, &mut rng());
        let tail: Vec<&BookLevel> = snap.asks.iter().filter(|l| l.synthetic).collect();
        assert_eq!(tail.len(), MAX_EXTRAPOLATED);
        assert!(tail.iter().all(|l| l.size >= 1.0));
        assert!(tail.iter().all(|l| l.price > 100.05));
        // Prices strictly increase away from the inside.
        for pair in tail.windows(2) {
            assert!(pair[1].price > pair[0].price);
        }
    }

    #[test]
    fn bid_extrapolation_stops_at_zero() {
        let agg = OrderBookAggregator::new();
        // Penny symbol: the ladder floor of 0.001 still walks to zero fast.
        agg.apply_quote(&quote("PENNY", 0.01, 100, 11, 0.011, 100, 12, 1_000));

        let snap = agg.snapshot_for("PENNY", 2_000, &mut rng());
        assert!(snap.bids.iter().all(|l| l.price > 0.0));
    }

    #[test]
    fn cumulative_sizes_walk_outward() {
        let agg = OrderBookAggregator::with_limits(DEFAULT_STALE_MS, 3);
        agg.apply_quote(&quote("AAPL", 100.00, 10, 11, 100.02, 5, 12, 1_000));
        agg.apply_quote(&quote("AAPL", 99.98, 20, 12, 0.0, 0, 0, 1_000));

        let snap = agg.snapshot_for("AAPL", 1_500, &mut rng());
        let mut running = 0.0;
        for level in &snap.bids {
            running += level.size;
            assert_eq!(level.cumulative, round6(running));
        }
        assert!(snap.bids.len() <= 3, "max_levels truncation applies");
    }

    #[test]
    fn unknown_symbol_yields_empty_book() {
        let agg = OrderBookAggregator::new();
        let snap = agg.snapshot_for("NOPE", 1_000, &mut rng());
        assert!(snap.bids.is_empty());
        assert!(snap.asks.is_empty());
        assert_eq!(snap.best_bid, 0.0);
        assert_eq!(snap.updates, 0);
    }

    #[test]
    fn display_step_snaps_up_the_ladder() {
        assert_eq!(display_step(100.0, 0.0), 0.05); // raw 0.04
        assert_eq!(display_step(250.0, 0.0), 0.10); // raw 0.10 exactly
        assert_eq!(display_step(0.0, 50.0), 0.02); // raw 0.02 from ask side
        assert_eq!(display_step(0.0, 0.0), 0.05); // reference falls back to 100
        assert_eq!(display_step(1_000_000.0, 0.0), 50.0); // past the ladder top
    }
}
