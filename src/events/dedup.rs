//! Expiring set of recently seen event keys

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Remembers keys for a fixed window
///
/// Entries expire lazily on access, oldest first, so the structure needs
/// no background task per key and its size is bounded by the event rate
/// over one window.
pub struct DedupWindow<K> {
    window: Duration,
    seen: HashMap<K, Instant>,
    order: VecDeque<(Instant, K)>,
}

impl<K: Eq + Hash + Clone> DedupWindow<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Records `key`. Returns `false` if it was already seen within the window.
    pub fn insert(&mut self, key: K) -> bool {
        self.insert_at(key, Instant::now())
    }

    fn insert_at(&mut self, key: K, now: Instant) -> bool {
        self.evict(now);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key.clone(), now);
        self.order.push_back((now, key));
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            if let Some((at, key)) = self.order.pop_front() {
                // Only drop the map entry if it belongs to this insertion
                if self.seen.get(&key) == Some(&at) {
                    self.seen.remove(&key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window() {
        let mut dedup = DedupWindow::new(Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(dedup.insert_at("a", t0));
        assert!(!dedup.insert_at("a", t0 + Duration::from_secs(59)));
        assert!(dedup.insert_at("b", t0 + Duration::from_secs(1)));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_key_expires_after_window() {
        let mut dedup = DedupWindow::new(Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(dedup.insert_at("a", t0));
        assert!(dedup.insert_at("b", t0 + Duration::from_secs(30)));
        assert!(dedup.insert_at("a", t0 + Duration::from_secs(60)));
        // "b" is still live, "a" was re-recorded
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.insert_at("b", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_flood_is_bounded_by_window() {
        let mut dedup = DedupWindow::new(Duration::from_secs(10));
        let t0 = Instant::now();
        for i in 0..1000u32 {
            dedup.insert_at(i, t0 + Duration::from_millis(i as u64 * 100));
        }
        assert!(dedup.len() <= 101);
    }
}
