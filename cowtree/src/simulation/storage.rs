//! Fault-injecting page store for deterministic testing.
//!
//! `SimulatedStore` wraps a `MemoryStore` and, driven by a seeded RNG, fails
//! some operations on purpose:
//! - Allocation errors (the tree must roll back and stay unchanged)
//! - Read errors (surface as `CorruptPage`)
//! - Corrupted reads: the page is returned with one bit flipped in the
//!   node's self-checking bytes, as a store without checksums would deliver
//!   it, and the tree's decode has to reject it. The stored page stays intact
//!
//! The same seed always produces the same sequence of faults.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::codec::{PageView, integrity_checked_ranges};
use crate::storage::{MemoryStore, Page, PageRef, PageStore, StoreError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of an allocation error (0.0 - 1.0).
    pub allocation_error_rate: f64,
    /// Probability that a read returns corrupted bytes (0.0 - 1.0).
    pub corruption_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with low fault rates (for stress testing).
    #[must_use]
    pub const fn low_faults() -> Self {
        Self {
            read_error_rate: 0.001,
            allocation_error_rate: 0.001,
            corruption_rate: 0.001,
        }
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.02,
            allocation_error_rate: 0.02,
            corruption_rate: 0.02,
        }
    }
}

/// Statistics about simulated store operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected allocation errors.
    pub injected_allocation_errors: u64,
    /// Number of corrupted pages returned.
    pub corrupted_reads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    injected_read_errors: AtomicU64,
    injected_allocation_errors: AtomicU64,
    corrupted_reads: AtomicU64,
}

/// A `MemoryStore` with seeded fault injection.
#[derive(Debug)]
pub struct SimulatedStore {
    inner: MemoryStore,
    fault_config: Mutex<FaultConfig>,
    rng: Mutex<StdRng>,
    counters: Counters,
}

impl SimulatedStore {
    /// Create a fault-free simulated store with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a simulated store with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            inner: MemoryStore::new(),
            fault_config: Mutex::new(fault_config),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            counters: Counters::default(),
        }
    }

    /// The wrapped store, for inspection without fault injection.
    #[must_use]
    pub const fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Get the current statistics.
    #[must_use]
    pub fn stats(&self) -> SimulatedStoreStats {
        SimulatedStoreStats {
            injected_read_errors: self.counters.injected_read_errors.load(Ordering::Relaxed),
            injected_allocation_errors: self
                .counters
                .injected_allocation_errors
                .load(Ordering::Relaxed),
            corrupted_reads: self.counters.corrupted_reads.load(Ordering::Relaxed),
        }
    }

    /// Update the fault configuration.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn set_fault_config(&self, config: FaultConfig) {
        *self.fault_config.lock().expect("lock poisoned") = config;
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn fault_config(&self) -> FaultConfig {
        self.fault_config.lock().expect("lock poisoned").clone()
    }

    /// Check if a fault should be injected based on the given rate.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().expect("lock poisoned").random::<f64>() < rate
    }

    /// Flip one random bit of a page copy, inside a byte range that the
    /// node decoder validates. Pages that do not decode are returned as is.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn corrupt_copy(&self, page: &Page) -> Page {
        let Ok(view) = PageView::new(page.as_bytes()) else {
            return page.clone();
        };
        let ranges = integrity_checked_ranges(&view);
        if ranges.is_empty() {
            return page.clone();
        }

        let mut rng = self.rng.lock().expect("lock poisoned");
        let range = ranges[rng.random_range(0..ranges.len())].clone();
        let byte_offset = rng.random_range(range);
        let bit = rng.random_range(0..8u8);

        let mut bytes = page.as_bytes().to_vec();
        bytes[byte_offset] ^= 1 << bit;
        Page::from_bytes(bytes)
    }
}

impl PageStore for SimulatedStore {
    fn dereference(&self, page_ref: PageRef) -> Result<Page, StoreError> {
        let config = self.fault_config();

        if self.should_inject_fault(config.read_error_rate) {
            self.counters
                .injected_read_errors
                .fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let page = self.inner.dereference(page_ref)?;

        if self.should_inject_fault(config.corruption_rate) {
            self.counters.corrupted_reads.fetch_add(1, Ordering::Relaxed);
            return Ok(self.corrupt_copy(&page));
        }

        Ok(page)
    }

    fn allocate(&self, page: Page) -> Result<PageRef, StoreError> {
        let config = self.fault_config();

        if self.should_inject_fault(config.allocation_error_rate) {
            self.counters
                .injected_allocation_errors
                .fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::InjectedFault(
                "simulated allocation error".to_string(),
            ));
        }

        self.inner.allocate(page)
    }

    fn release(&self, page_ref: PageRef) {
        self.inner.release(page_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::codec::{NodeType, PageBuilder, Payload};

    fn page(fill: u8) -> Page {
        Page::from_bytes(vec![fill; 64])
    }

    fn leaf_page(keys: &[&[u8]]) -> Page {
        let count = u16::try_from(keys.len()).expect("count");
        let mut builder = PageBuilder::new(NodeType::Leaf, count);
        for key in keys {
            builder
                .append_record(key, Payload::Value(b"value"))
                .expect("append");
        }
        Page::from_encoded(builder.finish().expect("finish"), 256).expect("page")
    }

    #[test]
    fn test_no_faults_behaves_like_memory_store() {
        let store = SimulatedStore::new(1);
        let a = store.allocate(page(3)).expect("allocate");
        assert_eq!(store.dereference(a).expect("deref"), page(3));
        store.release(a);
        assert_eq!(store.inner().live_pages(), 0);
        assert_eq!(store.stats(), SimulatedStoreStats::default());
    }

    #[test]
    fn test_allocation_faults() {
        let store = SimulatedStore::with_config(
            7,
            FaultConfig {
                allocation_error_rate: 1.0,
                ..FaultConfig::default()
            },
        );
        assert!(matches!(
            store.allocate(page(1)),
            Err(StoreError::InjectedFault(_))
        ));
        assert_eq!(store.stats().injected_allocation_errors, 1);
        assert_eq!(store.inner().live_pages(), 0);
    }

    #[test]
    fn test_corrupted_reads_fail_decode_and_leave_page_intact() {
        let store = SimulatedStore::new(11);
        let original = leaf_page(&[b"apple", b"banana", b"cherry", b"damson"]);
        let a = store.allocate(original.clone()).expect("allocate");

        store.set_fault_config(FaultConfig {
            corruption_rate: 1.0,
            ..FaultConfig::default()
        });
        for _ in 0..200 {
            let corrupted = store.dereference(a).expect("corrupted read");
            assert_ne!(corrupted, original);
            assert!(PageView::new(corrupted.as_bytes()).is_err());
        }

        store.set_fault_config(FaultConfig::no_faults());
        assert_eq!(store.dereference(a).expect("deref"), original);
        assert_eq!(store.stats().corrupted_reads, 200);
    }

    #[test]
    fn test_read_errors() {
        let store = SimulatedStore::with_config(
            3,
            FaultConfig {
                read_error_rate: 1.0,
                ..FaultConfig::default()
            },
        );
        let a = store.allocate(page(5)).expect("allocate");
        assert!(matches!(
            store.dereference(a),
            Err(StoreError::InjectedFault(_))
        ));
        assert_eq!(store.stats().injected_read_errors, 1);
    }

    #[test]
    fn test_same_seed_same_faults() {
        let run = |seed| {
            let store = SimulatedStore::with_config(seed, FaultConfig::high_faults());
            (0..500)
                .map(|i| store.allocate(page(u8::try_from(i % 256).expect("byte"))).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert!(run(42).contains(&false));
    }
}
