//! Ring of service-originated messages awaiting leader-side append.
//!
//! Followers fill the ring speculatively as their hosted services produce
//! messages; a leader drains it by appending to the log. When the appended
//! record comes back on the replay path, the sweeper drops every entry with
//! an id at or below the one observed in the log.

use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct PendingMessage {
    pub cluster_session_id: i64,
    pub payload: Bytes,
}

/// Arena ring with head/tail semantics over refcounted payload slices.
#[derive(Default)]
pub struct PendingServiceMessages {
    entries: VecDeque<PendingMessage>,
}

impl PendingServiceMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, cluster_session_id: i64, payload: Bytes) {
        self.entries.push_back(PendingMessage {
            cluster_session_id,
            payload,
        });
    }

    /// Consumes entries from the head while the predicate accepts them, up
    /// to `limit`. The predicate returning `false` (appender back-pressure,
    /// sweeper reaching a retained entry) stops the drain with the entry
    /// still at the head, preserving order for the next cycle.
    pub fn consume<P>(&mut self, mut predicate: P, limit: usize) -> usize
    where
        P: FnMut(&PendingMessage) -> bool,
    {
        let mut consumed = 0;
        while consumed < limit {
            match self.entries.front() {
                Some(entry) if predicate(entry) => {
                    self.entries.pop_front();
                    consumed += 1;
                }
                _ => break,
            }
        }
        consumed
    }

    pub fn reset(&mut self, capacity: usize) {
        self.entries = VecDeque::with_capacity(capacity);
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(ids: &[i64]) -> PendingServiceMessages {
        let mut ring = PendingServiceMessages::new();
        for id in ids {
            ring.append(*id, Bytes::from_static(b"m"));
        }
        ring
    }

    #[test]
    fn consume_in_fifo_order() {
        let mut ring = ring_of(&[-1, -2, -3]);
        let mut seen = Vec::new();
        ring.consume(
            |entry| {
                seen.push(entry.cluster_session_id);
                true
            },
            10,
        );
        assert_eq!(seen, vec![-1, -2, -3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn predicate_false_keeps_head() {
        let mut ring = ring_of(&[-1, -2]);
        let consumed = ring.consume(|entry| entry.cluster_session_id == -1, 10);
        assert_eq!(consumed, 1);
        assert_eq!(ring.size(), 1);
        assert_eq!(ring.iter().next().unwrap().cluster_session_id, -2);
    }

    #[test]
    fn limit_bounds_drain() {
        let mut ring = ring_of(&[-1, -2, -3]);
        assert_eq!(ring.consume(|_| true, 2), 2);
        assert_eq!(ring.size(), 1);
    }

    #[test]
    fn sweep_drops_up_to_observed_id() {
        let mut ring = ring_of(&[-1, -2, -3, -4]);
        let log_service_session_id = -3;
        // Ids grow downwards, so everything at or above the observed id in
        // magnitude order is discarded.
        ring.consume(
            |entry| entry.cluster_session_id >= log_service_session_id,
            usize::MAX,
        );
        assert_eq!(ring.size(), 1);
        assert_eq!(ring.iter().next().unwrap().cluster_session_id, -4);
    }
}
