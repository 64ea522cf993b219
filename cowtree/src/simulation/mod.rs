//! Deterministic simulation testing for the tree engine.
//!
//! Every random choice, in the workload and in the store's fault injection,
//! comes from a seeded RNG, so a failing seed replays exactly. The simulator
//! keeps an in-memory model of the expected contents and checks the tree
//! against it and against its structural invariants as it runs.
//!
//! # Usage
//!
//! ```
//! use cowtree::simulation::{FaultConfig, Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345).with_fault_config(FaultConfig::low_faults());
//! let mut sim = Simulator::new(config);
//! let result = sim.run(200);
//!
//! assert!(result.passed());
//! ```

mod simulator;
mod storage;

pub use simulator::{InvariantViolation, SimulationResult, Simulator, SimulatorConfig};
pub use storage::{FaultConfig, SimulatedStore, SimulatedStoreStats};
