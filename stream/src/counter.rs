//! Single-writer, multi-reader shared counters.
//!
//! Writers publish with release stores and readers observe with acquire
//! loads so an external observer polling a position counter sees every write
//! that happened before the published value.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn new(initial: i64) -> Self {
        Self {
            value: Arc::new(AtomicI64::new(initial)),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Relaxed read for the single writer's own use.
    pub fn get_weak(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_ordered(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn increment_ordered(&self) -> i64 {
        self.value.fetch_add(1, Ordering::Release) + 1
    }

    /// Advances the counter to `value` if it is greater than the current
    /// value. Returns whether the counter moved.
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        let current = self.value.load(Ordering::Relaxed);
        if value > current {
            self.value.store(value, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// A registry of typed, keyed counters so that co-located agents can discover
/// values published by another agent, e.g. the recovery state a module
/// publishes for its services.
#[derive(Clone, Default)]
pub struct Counters {
    entries: Arc<Mutex<Vec<CounterEntry>>>,
}

#[derive(Clone)]
struct CounterEntry {
    type_id: i32,
    label: String,
    key: Arc<Vec<i64>>,
    counter: Counter,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, type_id: i32, label: &str, key: &[i64]) -> Counter {
        let counter = Counter::new(0);
        self.entries.lock().unwrap().push(CounterEntry {
            type_id,
            label: label.to_string(),
            key: Arc::new(key.to_vec()),
            counter: counter.clone(),
        });
        counter
    }

    /// Most recently allocated live counter of the given type.
    pub fn find_by_type_id(&self, type_id: i32) -> Option<(Arc<Vec<i64>>, Counter)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|entry| entry.type_id == type_id)
            .map(|entry| (Arc::clone(&entry.key), entry.counter.clone()))
    }

    pub fn remove(&self, counter: &Counter) {
        self.entries
            .lock()
            .unwrap()
            .retain(|entry| !Arc::ptr_eq(&entry.counter.value, &counter.value));
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.label.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_max_only_moves_forward() {
        let counter = Counter::new(10);
        assert!(counter.propose_max_ordered(15));
        assert!(!counter.propose_max_ordered(12));
        assert_eq!(counter.get(), 15);
    }

    #[test]
    fn registry_finds_latest_of_type() {
        let counters = Counters::new();
        counters.allocate(7, "first", &[1]);
        let second = counters.allocate(7, "second", &[2, 3]);
        second.set_ordered(99);

        let (key, found) = counters.find_by_type_id(7).unwrap();
        assert_eq!(key.as_slice(), &[2, 3]);
        assert_eq!(found.get(), 99);

        counters.remove(&second);
        let (key, _) = counters.find_by_type_id(7).unwrap();
        assert_eq!(key.as_slice(), &[1]);
    }
}
