//! Per-operation statistics and the registries that hold them

use crate::timer::ElapsedTimer;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Rolling timer for one instrumented operation
#[derive(Debug)]
pub struct MethodStatistic {
    name: Arc<str>,
    timer: ElapsedTimer,
    enabled: AtomicBool,
}

impl MethodStatistic {
    pub fn new(name: Arc<str>, enabled: bool) -> Self {
        Self {
            name,
            timer: ElapsedTimer::new(),
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn timer(&self) -> &ElapsedTimer {
        &self.timer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record(&self, elapsed: Duration) {
        self.timer.record(elapsed);
    }

    pub fn count(&self) -> u64 {
        self.timer.count()
    }

    /// Lifetime mean call duration
    pub fn mean_duration(&self) -> Duration {
        self.timer.mean_duration()
    }

    /// Aggregate time spent in this operation: `count × mean duration`
    ///
    /// Uses the lifetime mean, which makes load equal to the exact lifetime
    /// total and therefore monotonic.
    pub fn load_nanos(&self) -> u64 {
        self.timer.total_nanos()
    }

    pub fn load(&self) -> Duration {
        Duration::from_nanos(self.load_nanos())
    }
}

/// Concurrent name → statistic map with first-writer-wins insertion
///
/// Iteration is weakly consistent: [`StatisticRegistry::snapshot`] clones the
/// `Arc`s out shard by shard and never holds a lock across caller work.
#[derive(Debug, Default)]
pub struct StatisticRegistry {
    entries: DashMap<Arc<str>, Arc<MethodStatistic>, FnvBuildHasher>,
}

impl StatisticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodStatistic>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the registered statistic for `name`, creating it if absent
    ///
    /// Under a race exactly one candidate is stored and every caller gets
    /// that winner back. `enabled` is only evaluated when creating.
    pub fn get_or_insert<F>(&self, name: &str, enabled: F) -> Arc<MethodStatistic>
    where
        F: FnOnce() -> bool,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        let key: Arc<str> = Arc::from(name);
        let winner = self
            .entries
            .entry(Arc::clone(&key))
            .or_insert_with(|| Arc::new(MethodStatistic::new(key, enabled())));
        Arc::clone(winner.value())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<MethodStatistic>> {
        self.entries.remove(name).map(|(_, statistic)| statistic)
    }

    /// Toggle an existing statistic; returns false if `name` is unknown
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.get(name) {
            Some(entry) => {
                entry.value().set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<MethodStatistic>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
