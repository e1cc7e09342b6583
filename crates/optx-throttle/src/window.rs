//! Rolling transaction window.

use optx_core::TransactionType;
use std::collections::VecDeque;

/// Timestamped transactions admitted within the last window.
///
/// Append-only at the back, pruned from the front. Timestamps are
/// non-decreasing because they are taken under the controller lock.
#[derive(Debug, Default)]
pub struct RateWindow {
    entries: VecDeque<(u64, TransactionType)>,
}

impl RateWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, now_ms: u64, tx_type: TransactionType) {
        self.entries.push_back((now_ms, tx_type));
    }

    /// Drop entries older than `window_ms`. An entry exactly `window_ms` old is kept.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(window_ms);
        let before = self.entries.len();
        while self.entries.front().is_some_and(|&(t, _)| t < cutoff) {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, tx_type: TransactionType) -> usize {
        self.entries.iter().filter(|(_, t)| *t == tx_type).count()
    }

    /// Timestamp of the oldest entry.
    pub fn oldest(&self) -> Option<u64> {
        self.entries.front().map(|&(t, _)| t)
    }

    /// Timestamp of the oldest entry of the given type.
    pub fn oldest_of(&self, tx_type: TransactionType) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, t)| *t == tx_type)
            .map(|&(ts, _)| ts)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_boundary_entry() {
        let mut window = RateWindow::with_capacity(4);
        window.push(1_000, TransactionType::NewOrder);
        window.push(1_500, TransactionType::Cancel);

        assert_eq!(window.prune(2_000, 1_000), 0);
        assert_eq!(window.len(), 2);

        assert_eq!(window.prune(2_001, 1_000), 1);
        assert_eq!(window.oldest(), Some(1_500));
    }

    #[test]
    fn test_count_and_oldest_by_type() {
        let mut window = RateWindow::default();
        window.push(10, TransactionType::Move);
        window.push(20, TransactionType::NewOrder);
        window.push(30, TransactionType::NewOrder);

        assert_eq!(window.count(TransactionType::NewOrder), 2);
        assert_eq!(window.count(TransactionType::Cancel), 0);
        assert_eq!(window.oldest_of(TransactionType::NewOrder), Some(20));
        assert_eq!(window.oldest_of(TransactionType::Cancel), None);
    }

    #[test]
    fn test_prune_before_first_window_is_noop() {
        let mut window = RateWindow::default();
        window.push(0, TransactionType::Move);

        assert_eq!(window.prune(500, 1_000), 0);
        assert!(!window.is_empty());
    }
}
