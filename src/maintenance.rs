//! Operation counter and swipe maintenance policy.
//!
//! The ELL14 piezo motor needs a full-range sweep ("swipe") every few thousand
//! moves to stay clean. [`MaintenanceCounter`] counts successful motion
//! commands since the last swipe and reports when the advisory is due.
//! Persistence is explicit: the controller calls [`MaintenanceCounter::load`]
//! and [`MaintenanceCounter::save`] at the points its [`CounterPersistence`]
//! policy names.

use serde::{Deserialize, Serialize};
use stage_core::{PropertyStore, StageError, StageResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Property name the counter is stored under.
pub const NUM_OPERATIONS_PROPERTY: &str = "num_operations";

/// Default number of operations before a swipe is advised.
pub const DEFAULT_SWIPE_THRESHOLD: u64 = 10_000;

/// When the counter touches the property store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterPersistence {
    /// Never load or save; the counter starts at zero with every process.
    InMemory,
    /// Load on initialize, save on shutdown.
    #[default]
    OnShutdown,
    /// Load on initialize, save after every change and on shutdown.
    EveryOperation,
}

impl CounterPersistence {
    /// Whether the counter is restored on initialize.
    pub fn loads(self) -> bool {
        !matches!(self, CounterPersistence::InMemory)
    }

    /// Whether the counter is saved on shutdown.
    pub fn saves_on_shutdown(self) -> bool {
        !matches!(self, CounterPersistence::InMemory)
    }

    /// Whether the counter is saved after every increment and reset.
    pub fn saves_each_change(self) -> bool {
        matches!(self, CounterPersistence::EveryOperation)
    }
}

impl fmt::Display for CounterPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CounterPersistence::InMemory => "in_memory",
            CounterPersistence::OnShutdown => "on_shutdown",
            CounterPersistence::EveryOperation => "every_operation",
        };
        f.write_str(label)
    }
}

/// Counts successful motion commands since the last swipe.
#[derive(Debug)]
pub struct MaintenanceCounter {
    count: AtomicU64,
    threshold: u64,
}

impl MaintenanceCounter {
    /// Create a counter at zero with the given advisory threshold.
    pub fn new(threshold: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            threshold,
        }
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Advisory threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Count one successful motion command. Returns the new count.
    ///
    /// Saturates at `u64::MAX`.
    pub fn increment(&self) -> u64 {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or_else(|n| n);
        previous.saturating_add(1)
    }

    /// Zero the counter after a completed swipe.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    /// Whether a swipe should be advised (`count > threshold`).
    pub fn is_over_threshold(&self) -> bool {
        self.count() > self.threshold
    }

    /// Restore the count for `device` from the store.
    ///
    /// A missing or unparsable value restores zero. A store failure also
    /// resets the count to zero and is returned as [`StageError::Persistence`].
    pub fn load(&self, store: &dyn PropertyStore, device: &str) -> StageResult<u64> {
        let raw = match store.get(device, NUM_OPERATIONS_PROPERTY) {
            Ok(raw) => raw,
            Err(e) => {
                self.reset();
                return Err(StageError::persistence(e));
            }
        };

        let count = match raw.as_deref().map(str::trim) {
            None => 0,
            Some(text) => text.parse::<u64>().unwrap_or_else(|e| {
                tracing::warn!(
                    device,
                    value = text,
                    error = %e,
                    "Unparsable persisted operation count, starting from zero"
                );
                0
            }),
        };

        self.count.store(count, Ordering::SeqCst);
        tracing::debug!(device, count, "Restored operation count");
        Ok(count)
    }

    /// Write the current count for `device` to the store.
    pub fn save(&self, store: &dyn PropertyStore, device: &str) -> StageResult<()> {
        let count = self.count();
        store
            .put(device, NUM_OPERATIONS_PROPERTY, &count.to_string())
            .map_err(StageError::persistence)?;
        tracing::trace!(device, count, "Saved operation count");
        Ok(())
    }
}

impl Default for MaintenanceCounter {
    fn default() -> Self {
        Self::new(DEFAULT_SWIPE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPropertyStore;

    struct BrokenStore;

    impl PropertyStore for BrokenStore {
        fn get(&self, _device: &str, _attribute: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("database unavailable")
        }

        fn put(&self, _device: &str, _attribute: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let counter = MaintenanceCounter::new(3);
        for _ in 0..3 {
            counter.increment();
        }
        assert!(!counter.is_over_threshold());
        assert_eq!(counter.increment(), 4);
        assert!(counter.is_over_threshold());

        counter.reset();
        assert_eq!(counter.count(), 0);
        assert!(!counter.is_over_threshold());
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryPropertyStore::new();
        let counter = MaintenanceCounter::default();
        counter.increment();
        counter.increment();
        counter.save(&store, "lab/rot/1").unwrap();

        assert_eq!(
            store.get("lab/rot/1", NUM_OPERATIONS_PROPERTY).unwrap().as_deref(),
            Some("2")
        );

        let restored = MaintenanceCounter::default();
        assert_eq!(restored.load(&store, "lab/rot/1").unwrap(), 2);
        assert_eq!(restored.count(), 2);
    }

    #[test]
    fn test_missing_and_garbage_values_load_as_zero() {
        let store = MemoryPropertyStore::new();
        let counter = MaintenanceCounter::default();
        counter.increment();
        assert_eq!(counter.load(&store, "lab/rot/1").unwrap(), 0);

        store.put("lab/rot/1", NUM_OPERATIONS_PROPERTY, "many").unwrap();
        counter.increment();
        assert_eq!(counter.load(&store, "lab/rot/1").unwrap(), 0);
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_store_failure_is_persistence_error() {
        let counter = MaintenanceCounter::default();
        counter.increment();

        let err = counter.load(&BrokenStore, "lab/rot/1").unwrap_err();
        assert!(matches!(err, StageError::Persistence(_)));
        // Failed load starts from zero
        assert_eq!(counter.count(), 0);

        assert!(matches!(
            counter.save(&BrokenStore, "lab/rot/1"),
            Err(StageError::Persistence(_))
        ));
    }

    #[test]
    fn test_increment_saturates_at_max() {
        let store = MemoryPropertyStore::new();
        store
            .put("lab/rot/1", NUM_OPERATIONS_PROPERTY, &u64::MAX.to_string())
            .unwrap();

        let counter = MaintenanceCounter::new(10);
        assert_eq!(counter.load(&store, "lab/rot/1").unwrap(), u64::MAX);
        assert_eq!(counter.increment(), u64::MAX);
        assert_eq!(counter.count(), u64::MAX);
        assert!(counter.is_over_threshold());
    }

    #[test]
    fn test_persistence_policy_flags() {
        assert_eq!(CounterPersistence::default(), CounterPersistence::OnShutdown);
        assert!(!CounterPersistence::InMemory.loads());
        assert!(!CounterPersistence::InMemory.saves_on_shutdown());
        assert!(CounterPersistence::OnShutdown.loads());
        assert!(!CounterPersistence::OnShutdown.saves_each_change());
        assert!(CounterPersistence::EveryOperation.saves_each_change());
        assert!(CounterPersistence::EveryOperation.saves_on_shutdown());
    }
}
