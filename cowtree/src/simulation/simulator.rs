//! Main simulator harness for deterministic simulation testing.
//!
//! Runs a seeded random mix of inserts, deletes and lookups against a tree
//! over a `SimulatedStore`, mirrors every successful mutation in a
//! `BTreeMap` model, and checks after each step that:
//! - Lookups agree with the model
//! - A failed mutation left the root and the live page set untouched
//! - Every injected fault, including corrupted page bytes the store hands
//!   back as if they were valid, failed exactly one operation
//! - The tree's structural invariants hold and it owns exactly the live pages

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::storage::{FaultConfig, SimulatedStore, SimulatedStoreStats};
use crate::btree::{BTree, BTreeError, MAX_KEY_SIZE, MAX_VAL_SIZE};
use crate::config::TreeConfig;

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility.
    pub seed: u64,
    /// Fault injection configuration.
    pub fault_config: FaultConfig,
    /// Tree configuration.
    pub tree_config: TreeConfig,
    /// Number of distinct keys operations draw from.
    pub key_space: usize,
    /// Keys are between 9 and this many bytes long.
    pub max_key_len: usize,
    /// Values are between 0 and this many bytes long.
    pub max_value_len: usize,
    /// Fraction of operations that are deletes.
    pub delete_rate: f64,
    /// Fraction of operations that are lookups.
    pub get_rate: f64,
    /// Verify the whole tree every this many operations.
    pub check_interval: usize,
}

impl SimulatorConfig {
    /// Create a new simulator config with the given seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            fault_config: FaultConfig::default(),
            tree_config: TreeConfig::default(),
            key_space: 2000,
            max_key_len: 64,
            max_value_len: 256,
            delete_rate: 0.3,
            get_rate: 0.2,
            check_interval: 25,
        }
    }

    /// Set the fault configuration.
    #[must_use]
    pub const fn with_fault_config(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    /// Set the key and value size limits.
    #[must_use]
    pub const fn with_record_sizes(mut self, max_key_len: usize, max_value_len: usize) -> Self {
        self.max_key_len = max_key_len;
        self.max_value_len = max_value_len;
        self
    }

    /// Set the number of distinct keys.
    #[must_use]
    pub const fn with_key_space(mut self, key_space: usize) -> Self {
        self.key_space = key_space;
        self
    }

    /// Verify the whole tree every `interval` operations (1 checks after each).
    #[must_use]
    pub const fn with_check_interval(mut self, interval: usize) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set the operation mix.
    #[must_use]
    pub const fn with_rates(mut self, delete_rate: f64, get_rate: f64) -> Self {
        self.delete_rate = delete_rate;
        self.get_rate = get_rate;
        self
    }
}

/// An invariant violation detected during simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Description of the violation.
    pub description: String,
    /// Index of the operation after which it was detected.
    pub operation_index: usize,
}

/// Results from a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The seed used for this simulation.
    pub seed: u64,
    /// Number of operations executed.
    pub operations: usize,
    /// Number of successful operations.
    pub successful_operations: u64,
    /// Number of operations that failed on an injected fault.
    pub failed_operations: u64,
    /// Invariant violations detected.
    pub invariant_violations: Vec<InvariantViolation>,
    /// Keys in the tree at the end of the run.
    pub final_keys: usize,
    /// Height of the tree at the end of the run.
    pub final_height: usize,
    /// Greatest height reached during the run.
    pub max_height: usize,
    /// Faults the store injected.
    pub store_stats: SimulatedStoreStats,
}

impl SimulationResult {
    /// Check if the simulation passed (no invariant violations).
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.invariant_violations.is_empty()
    }
}

/// The main simulator harness.
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    model: BTreeMap<Vec<u8>, Vec<u8>>,
    violations: Vec<InvariantViolation>,
    successful_operations: u64,
    failed_operations: u64,
    max_height: usize,
}

enum Operation {
    Insert(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    Get(Vec<u8>),
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            model: BTreeMap::new(),
            violations: Vec::new(),
            successful_operations: 0,
            failed_operations: 0,
            max_height: 0,
        }
    }

    /// Run the simulation for a given number of operations.
    ///
    /// A setup failure (the tree cannot even be created) is reported as a
    /// violation at operation 0.
    pub fn run(&mut self, operation_count: usize) -> SimulationResult {
        // The store's RNG is offset from the workload RNG so the two streams differ.
        let store = SimulatedStore::with_config(
            self.config.seed.wrapping_add(1),
            FaultConfig::no_faults(),
        );

        let tree = match BTree::create(store, self.config.tree_config) {
            Ok(tree) => tree,
            Err(e) => {
                self.violate(0, format!("failed to create tree: {e}"));
                return self.result(operation_count, 0, 0, SimulatedStoreStats::default());
            }
        };
        tree.store().set_fault_config(self.config.fault_config.clone());

        for index in 0..operation_count {
            let operation = self.next_operation();
            self.apply(&tree, &operation, index);

            if (index + 1) % self.config.check_interval.max(1) == 0 {
                self.verify(&tree, index);
            }
        }

        let store_stats = tree.store().stats();
        let injected = store_stats.injected_read_errors
            + store_stats.injected_allocation_errors
            + store_stats.corrupted_reads;
        if injected != self.failed_operations {
            self.violate(
                operation_count,
                format!(
                    "{injected} faults injected but {} operations failed",
                    self.failed_operations
                ),
            );
        }

        self.verify(&tree, operation_count);
        self.compare_contents(&tree, operation_count);

        let (keys, height) = tree
            .check_invariants()
            .map_or((0, 0), |stats| (stats.keys, stats.height));
        self.result(operation_count, keys, height, store_stats)
    }

    fn result(
        &self,
        operations: usize,
        final_keys: usize,
        final_height: usize,
        store_stats: SimulatedStoreStats,
    ) -> SimulationResult {
        SimulationResult {
            seed: self.config.seed,
            operations,
            successful_operations: self.successful_operations,
            failed_operations: self.failed_operations,
            invariant_violations: self.violations.clone(),
            final_keys,
            final_height,
            max_height: self.max_height,
            store_stats,
        }
    }

    fn violate(&mut self, operation_index: usize, description: String) {
        tracing::error!(seed = self.config.seed, operation_index, %description, "invariant violation");
        self.violations.push(InvariantViolation {
            description,
            operation_index,
        });
    }

    /// Deterministic key for slot `index`: a fixed prefix padded to a
    /// length derived from the slot, so each slot always maps to one key.
    fn key_for(&self, index: usize) -> Vec<u8> {
        let max_len = self.config.max_key_len.clamp(9, MAX_KEY_SIZE);
        let mut key = format!("k{index:08}").into_bytes();
        let extra = (index.wrapping_mul(40_503)) % (max_len - key.len() + 1);
        key.extend(std::iter::repeat_n(b'_', extra));
        key
    }

    fn next_operation(&mut self) -> Operation {
        let slot = self.rng.random_range(0..self.config.key_space.max(1));
        let key = self.key_for(slot);
        let roll = self.rng.random::<f64>();

        if roll < self.config.get_rate {
            Operation::Get(key)
        } else if roll < self.config.get_rate + self.config.delete_rate {
            Operation::Delete(key)
        } else {
            let len = self
                .rng
                .random_range(0..=self.config.max_value_len.min(MAX_VAL_SIZE));
            let mut value = vec![0u8; len];
            self.rng.fill(value.as_mut_slice());
            Operation::Insert(key, value)
        }
    }

    fn apply(&mut self, tree: &BTree<SimulatedStore>, operation: &Operation, index: usize) {
        let root_before = tree.root();
        let live_before = tree.store().inner().live_refs();

        let outcome = match operation {
            Operation::Insert(key, value) => tree.insert(key, value).map(|()| {
                self.model.insert(key.clone(), value.clone());
            }),
            Operation::Delete(key) => tree.delete(key).map(|removed| {
                let expected = self.model.remove(key).is_some();
                if removed != expected {
                    self.violate(
                        index,
                        format!("delete returned {removed}, model expected {expected}"),
                    );
                }
            }),
            Operation::Get(key) => tree.get(key).map(|value| {
                if value.as_ref() != self.model.get(key) {
                    self.violate(index, format!("get {key:?} disagrees with the model"));
                }
            }),
        };

        match outcome {
            Ok(()) => self.successful_operations += 1,
            Err(BTreeError::AllocationFailed(_) | BTreeError::CorruptPage { .. }) => {
                self.failed_operations += 1;
                if tree.root() != root_before {
                    self.violate(index, "failed operation changed the root".to_string());
                }
                if tree.store().inner().live_refs() != live_before {
                    self.violate(index, "failed operation changed the live pages".to_string());
                }
            }
            Err(e) => self.violate(index, format!("unexpected error: {e}")),
        }
    }

    /// Structural check with fault injection paused.
    fn verify(&mut self, tree: &BTree<SimulatedStore>, index: usize) {
        tree.store().set_fault_config(FaultConfig::no_faults());

        match tree.check_invariants() {
            Ok(stats) => {
                self.max_height = self.max_height.max(stats.height);
                if stats.keys != self.model.len() {
                    self.violate(
                        index,
                        format!("tree has {} keys, model has {}", stats.keys, self.model.len()),
                    );
                }
                let live = tree.store().inner().live_pages();
                if live != stats.pages() {
                    self.violate(
                        index,
                        format!("{live} live pages but the tree uses {}", stats.pages()),
                    );
                }
            }
            Err(e) => self.violate(index, format!("invariant check failed: {e}")),
        }

        tree.store().set_fault_config(self.config.fault_config.clone());
    }

    /// Compare a full scan against the model with fault injection paused.
    fn compare_contents(&mut self, tree: &BTree<SimulatedStore>, index: usize) {
        tree.store().set_fault_config(FaultConfig::no_faults());

        let mut scanned = Vec::with_capacity(self.model.len());
        let scan = tree.iter().and_then(|mut iter| {
            while let Some(entry) = iter.next_entry()? {
                scanned.push(entry);
            }
            Ok(())
        });

        match scan {
            Ok(()) => {
                let expected: Vec<(Vec<u8>, Vec<u8>)> = self
                    .model
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if scanned != expected {
                    self.violate(index, "full scan disagrees with the model".to_string());
                }
            }
            Err(e) => self.violate(index, format!("full scan failed: {e}")),
        }
    }
}
