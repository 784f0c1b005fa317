//! Sequence numbering and inbound ordering.
//!
//! Outbound envelopes are numbered by a [`MonotonicCounter`] starting at 1.
//! Inbound envelopes pass through a [`ReorderWindow`] which releases them in
//! strictly increasing sequence order, buffering early arrivals and rejecting
//! anything at or below the last released sequence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReorderError {
    #[error("sequence {sequence} already accepted (next expected {next_expected})")]
    Replayed { sequence: u64, next_expected: u64 },
    #[error("sequence {sequence} is already buffered")]
    Duplicate { sequence: u64 },
}

/// Reorders inbound items by sequence number within a bounded window.
///
/// Items with `next_expected <= seq < next_expected + window` are accepted;
/// the one equal to `next_expected` releases itself and every consecutive
/// buffered successor. An arrival at or past the window edge gives up on the
/// gap: everything buffered is released in order, followed by the arrival,
/// and the missing sequences are treated as consumed.
#[derive(Debug)]
pub struct ReorderWindow<T> {
    next_expected: u64,
    window: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderWindow<T> {
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: 1,
            window: window.max(1) as u64,
            pending: BTreeMap::new(),
        }
    }

    /// Admit an item. Returns the items now deliverable, in order; an empty
    /// vector means the item was buffered.
    pub fn admit(&mut self, sequence: u64, item: T) -> Result<Vec<T>, ReorderError> {
        if sequence < self.next_expected {
            return Err(ReorderError::Replayed {
                sequence,
                next_expected: self.next_expected,
            });
        }
        if self.pending.contains_key(&sequence) {
            return Err(ReorderError::Duplicate { sequence });
        }

        if sequence - self.next_expected >= self.window {
            let mut released: Vec<T> = std::mem::take(&mut self.pending).into_values().collect();
            released.push(item);
            self.next_expected = sequence + 1;
            return Ok(released);
        }

        self.pending.insert(sequence, item);
        let mut released = Vec::new();
        while let Some(next) = self.pending.remove(&self.next_expected) {
            released.push(next);
            self.next_expected += 1;
        }
        Ok(released)
    }

    /// Highest sequence released so far (0 before the first release).
    pub fn last_accepted(&self) -> u64 {
        self.next_expected - 1
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Lock-free counter handing out sequence numbers.
#[derive(Debug)]
pub struct MonotonicCounter {
    value: AtomicU64,
}

impl MonotonicCounter {
    pub fn new(initial: u64) -> Self {
        Self { value: AtomicU64::new(initial) }
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl Default for MonotonicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut w = ReorderWindow::new(8);
        for seq in 1..=5u64 {
            assert_eq!(w.admit(seq, seq).unwrap(), vec![seq]);
        }
        assert_eq!(w.last_accepted(), 5);
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut w = ReorderWindow::new(8);
        assert!(w.admit(3, "c").unwrap().is_empty());
        assert!(w.admit(2, "b").unwrap().is_empty());
        assert_eq!(w.buffered(), 2);
        assert_eq!(w.admit(1, "a").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn test_regression_is_replay() {
        let mut w = ReorderWindow::new(8);
        w.admit(1, ()).unwrap();
        w.admit(2, ()).unwrap();
        assert_eq!(
            w.admit(2, ()),
            Err(ReorderError::Replayed { sequence: 2, next_expected: 3 })
        );
        assert_eq!(
            w.admit(1, ()),
            Err(ReorderError::Replayed { sequence: 1, next_expected: 3 })
        );
    }

    #[test]
    fn test_duplicate_while_buffered() {
        let mut w = ReorderWindow::new(8);
        w.admit(4, ()).unwrap();
        assert_eq!(w.admit(4, ()), Err(ReorderError::Duplicate { sequence: 4 }));
    }

    #[test]
    fn test_beyond_window_skips_gap() {
        let mut w = ReorderWindow::new(4);
        w.admit(1, 1).unwrap();
        assert!(w.admit(3, 3).unwrap().is_empty());
        // 2 + 4 = 6 is the window edge
        assert_eq!(w.admit(6, 6).unwrap(), vec![3, 6]);
        assert_eq!(w.next_expected(), 7);
        // the abandoned gap is now replay territory
        assert!(matches!(w.admit(2, 2), Err(ReorderError::Replayed { .. })));
    }

    #[test]
    fn test_zero_window_clamps_to_one() {
        let mut w = ReorderWindow::new(0);
        assert_eq!(w.admit(1, 'a').unwrap(), vec!['a']);
        assert_eq!(w.admit(3, 'c').unwrap(), vec!['c']);
    }

    #[test]
    fn test_monotonic_counter() {
        let counter = MonotonicCounter::default();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.current(), 2);
    }
}
