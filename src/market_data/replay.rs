// =============================================================================
// Replay Buffer — per-symbol second-indexed last-price store
// =============================================================================

use std::collections::BTreeMap;

/// Entries kept before a trim kicks in.
const HIGH_WATERMARK: usize = 50_000;
/// Entries retained after a trim.
const LOW_WATERMARK: usize = 40_000;

/// Last observed price per epoch second for a single symbol. Newly
/// connecting chart clients are bootstrapped from this history.
///
/// Writes are last-write-wins per second. When the buffer grows past the
/// high watermark the oldest seconds are discarded down to the low
/// watermark, so memory stays bounded over long sessions.
pub struct ReplayBuffer {
    points: BTreeMap<i64, f64>,
    high_watermark: usize,
    low_watermark: usize,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::with_watermarks(HIGH_WATERMARK, LOW_WATERMARK)
    }

    /// Watermark override for tests.
    pub fn with_watermarks(high: usize, low: usize) -> Self {
        assert!(low <= high, "low watermark must not exceed high");
        Self {
            points: BTreeMap::new(),
            high_watermark: high,
            low_watermark: low,
        }
    }

    /// Record the last price seen in `epoch_secs`, overwriting any earlier
    /// price in the same second, then trim if over the high watermark.
    pub fn record(&mut self, epoch_secs: i64, price: f64) {
        self.points.insert(epoch_secs, price);
        if self.points.len() > self.high_watermark {
            while self.points.len() > self.low_watermark {
                self.points.pop_first();
            }
        }
    }

    /// All points in time-ascending order.
    pub fn points(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.points.iter().map(|(t, v)| (*t, *v))
    }

    /// Newest (second, price) entry, if any.
    pub fn latest(&self) -> Option<(i64, f64)> {
        self.points.iter().next_back().map(|(t, v)| (*t, *v))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_per_second() {
        let mut buf = ReplayBuffer::new();
        buf.record(100, 10.0);
        buf.record(100, 11.5);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.latest(), Some((100, 11.5)));
    }

    #[test]
    fn points_come_back_sorted() {
        let mut buf = ReplayBuffer::new();
        buf.record(300, 3.0);
        buf.record(100, 1.0);
        buf.record(200, 2.0);
        let times: Vec<i64> = buf.points().map(|(t, _)| t).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[test]
    fn trim_keeps_newest_down_to_low_watermark() {
        let mut buf = ReplayBuffer::with_watermarks(50, 40);
        for sec in 0..51 {
            buf.record(sec, sec as f64);
            assert!(buf.len() <= 50, "size must never exceed the high watermark");
        }
        // The 51st insert crossed the watermark and triggered a trim.
        assert_eq!(buf.len(), 40);
        let oldest = buf.points().next().expect("non-empty");
        assert_eq!(oldest.0, 11, "newest 40 seconds are retained");
        assert_eq!(buf.latest(), Some((50, 50.0)));
    }

    #[test]
    fn empty_buffer_has_no_latest() {
        let buf = ReplayBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.latest(), None);
    }
}
