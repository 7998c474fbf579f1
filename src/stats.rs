//! Statistics registry
//!
//! Counters are created and wired here; backends only increment them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A shared, cheaply clonable counter
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.add(-1);
    }

    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Entry {
    description: String,
    counter: Counter,
}

/// Registry of named counters
#[derive(Debug, Default)]
pub struct Statistics {
    counters: Mutex<BTreeMap<String, Entry>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter. Registering an existing name returns the same counter.
    pub fn register(&self, name: &str, description: &str) -> Counter {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = counters.get(name) {
            debug!("Counter {} registered twice", name);
            return existing.counter.clone();
        }
        let counter = Counter::default();
        counters.insert(
            name.to_string(),
            Entry {
                description: description.to_string(),
                counter: counter.clone(),
            },
        );
        counter
    }

    pub fn lookup(&self, name: &str) -> Option<Counter> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .map(|e| e.counter.clone())
    }

    /// `(name, value, description)` for every counter, sorted by name
    pub fn snapshot(&self) -> Vec<(String, i64, String)> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, e)| (name.clone(), e.counter.get(), e.description.clone()))
            .collect()
    }
}

/// Registers counters below a fixed prefix, e.g. `cache.<instance>`
#[derive(Debug, Clone)]
pub struct StatisticsTemplate {
    prefix: String,
    statistics: Arc<Statistics>,
}

impl StatisticsTemplate {
    pub fn new(prefix: impl Into<String>, statistics: Arc<Statistics>) -> Self {
        Self {
            prefix: prefix.into(),
            statistics,
        }
    }

    pub fn register(&self, name: &str, description: &str) -> Counter {
        self.statistics
            .register(&format!("{}.{}", self.prefix, name), description)
    }
}

/// Counters every backend maintains
#[derive(Debug, Clone)]
pub struct BackendCounters {
    pub n_hits: Counter,
    pub n_misses: Counter,
    pub n_commits: Counter,
    pub n_write_failures: Counter,
}

impl BackendCounters {
    pub fn register(template: &StatisticsTemplate) -> Self {
        Self {
            n_hits: template.register("n_hits", "Number of objects served"),
            n_misses: template.register("n_misses", "Number of lookups without result"),
            n_commits: template.register("n_commits", "Number of committed objects"),
            n_write_failures: template.register("n_write_failures", "Number of failed writes"),
        }
    }

    /// Counters that are registered nowhere, for backends built outside a boot
    pub fn detached() -> Self {
        Self {
            n_hits: Counter::default(),
            n_misses: Counter::default(),
            n_commits: Counter::default(),
            n_write_failures: Counter::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_increment() {
        let stats = Statistics::new();
        let c = stats.register("strata.n_fs_open", "opens");
        c.inc();
        c.inc();
        c.dec();
        assert_eq!(stats.lookup("strata.n_fs_open").unwrap().get(), 1);
    }

    #[test]
    fn register_twice_shares_counter() {
        let stats = Statistics::new();
        let a = stats.register("x", "first");
        let b = stats.register("x", "second");
        a.add(5);
        assert_eq!(b.get(), 5);
        assert_eq!(stats.snapshot()[0].2, "first");
    }

    #[test]
    fn template_prefixes_names() {
        let stats = Arc::new(Statistics::new());
        let template = StatisticsTemplate::new("cache.mem", stats.clone());
        let counters = BackendCounters::register(&template);
        counters.n_hits.inc();
        assert_eq!(stats.lookup("cache.mem.n_hits").unwrap().get(), 1);
        assert!(stats.lookup("cache.mem.n_commits").is_some());
    }
}
