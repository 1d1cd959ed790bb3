//! Deterministic simulation of the join engine.
//!
//! A seeded generator writes to an in-memory left and right table while a
//! `JoinChangeListener` follows them. Every join event is folded into a
//! materialized view, which must equal the join recomputed from the tables
//! after each operation.
//!
//! # Design Principles
//!
//! 1. All randomness is seeded; the same seed replays the same operations
//! 2. Every left-side operation produces at least one event, so the
//!    simulator knows when the engine has caught up
//! 3. After the run the output is dropped and every cursor must be closed
//!
//! # Usage
//!
//! ```ignore
//! use changefeed::simulation::{Simulator, SimulatorConfig};
//!
//! let config = SimulatorConfig::new(12345).with_steps(500);
//! let result = Simulator::new(config).run().await;
//!
//! assert!(result.passed());
//! ```

mod invariants;
mod operations;
mod simulator;

pub use invariants::{InvariantChecker, InvariantViolation, MaterializedView, expected_join};
pub use operations::{Operation, OperationGenerator};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
