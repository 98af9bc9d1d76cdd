//! Deadline-ordered timer service.
//!
//! A keyed min-heap of `correlation_id -> deadline`. Rescheduling a live
//! correlation id supersedes the earlier deadline; superseded heap entries
//! are recognised by sequence number and skipped when they surface. Timers
//! with equal deadlines fire in insertion order.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;

#[derive(Eq, Ord, PartialEq, PartialOrd)]
struct TimerEntry {
    deadline_ms: i64,
    seq: u64,
    correlation_id: i64,
}

#[derive(Default)]
pub struct TimerService {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    live: HashMap<i64, u64>,
    next_seq: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, correlation_id: i64, deadline_ms: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(correlation_id, seq);
        self.heap.push(Reverse(TimerEntry {
            deadline_ms,
            seq,
            correlation_id,
        }));
    }

    /// Returns whether a live timer existed for the correlation id.
    pub fn cancel(&mut self, correlation_id: i64) -> bool {
        self.live.remove(&correlation_id).is_some()
    }

    /// Fires every timer due at `now_ms`. The handler returns `false` on
    /// back-pressure, in which case the timer is reinstated and the poll
    /// stops so ordering is preserved on retry.
    pub fn poll<H>(&mut self, now_ms: i64, mut handler: H) -> usize
    where
        H: FnMut(i64) -> bool,
    {
        let mut fired = 0;

        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline_ms > now_ms {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");

            match self.live.get(&entry.correlation_id) {
                Some(&seq) if seq == entry.seq => {}
                _ => continue, // cancelled or superseded
            }

            if handler(entry.correlation_id) {
                self.live.remove(&entry.correlation_id);
                fired += 1;
            } else {
                self.heap.push(Reverse(entry));
                break;
            }
        }

        fired
    }

    pub fn timer_count(&self) -> usize {
        self.live.len()
    }

    /// Dumps the live `(correlation_id, deadline_ms)` pairs for a snapshot.
    pub fn snapshot<F>(&self, mut f: F)
    where
        F: FnMut(i64, i64),
    {
        for Reverse(entry) in &self.heap {
            if self.live.get(&entry.correlation_id) == Some(&entry.seq) {
                f(entry.correlation_id, entry.deadline_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(timers: &mut TimerService, now_ms: i64) -> Vec<i64> {
        let mut fired = Vec::new();
        timers.poll(now_ms, |correlation_id| {
            fired.push(correlation_id);
            true
        });
        fired
    }

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let mut timers = TimerService::new();
        timers.schedule(1, 100);
        timers.schedule(2, 50);
        timers.schedule(3, 100);

        assert_eq!(drain(&mut timers, 49), Vec::<i64>::new());
        assert_eq!(drain(&mut timers, 100), vec![2, 1, 3]);
        assert_eq!(timers.timer_count(), 0);
    }

    #[test]
    fn cancel_prevents_fire() {
        let mut timers = TimerService::new();
        timers.schedule(7, 10);
        assert!(timers.cancel(7));
        assert!(!timers.cancel(7));
        assert_eq!(drain(&mut timers, 20), Vec::<i64>::new());
    }

    #[test]
    fn reschedule_supersedes_deadline() {
        let mut timers = TimerService::new();
        timers.schedule(7, 10);
        timers.schedule(7, 30);
        assert_eq!(drain(&mut timers, 20), Vec::<i64>::new());
        assert_eq!(drain(&mut timers, 30), vec![7]);
    }

    #[test]
    fn back_pressure_reinstates_and_stops() {
        let mut timers = TimerService::new();
        timers.schedule(1, 10);
        timers.schedule(2, 20);

        let mut accept = false;
        let fired = timers.poll(25, |_| {
            let result = accept;
            accept = true;
            result
        });
        assert_eq!(fired, 0);
        assert_eq!(drain(&mut timers, 25), vec![1, 2]);
    }

    #[test]
    fn snapshot_lists_live_timers() {
        let mut timers = TimerService::new();
        timers.schedule(1, 10);
        timers.schedule(2, 20);
        timers.cancel(1);

        let mut dumped = Vec::new();
        timers.snapshot(|correlation_id, deadline_ms| dumped.push((correlation_id, deadline_ms)));
        assert_eq!(dumped, vec![(2, 20)]);
    }
}
