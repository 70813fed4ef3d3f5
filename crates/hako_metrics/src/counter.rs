//! Named counters for tracking bridge events

use std::collections::HashMap;

#[derive(Debug)]
pub struct Counter {
    counters: HashMap<String, usize>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    pub fn increment(&mut self, name: &str, value: usize) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn get(&self, name: &str) -> usize {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn reset_all(&mut self) {
        self.counters.clear();
    }

    /// All counters sorted by name.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        let mut entries: Vec<_> = self
            .counters
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        entries.sort();
        entries
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_sorted() {
        let mut counter = Counter::new();
        counter.increment("jobs.executed", 4);
        counter.increment("callbacks.dispatched", 1);
        assert_eq!(
            counter.snapshot(),
            vec![
                ("callbacks.dispatched".to_string(), 1),
                ("jobs.executed".to_string(), 4)
            ]
        );
        counter.reset_all();
        assert!(counter.snapshot().is_empty());
    }
}
