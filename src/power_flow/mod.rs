//! Load flow and operating-limit checks for restored feeders.
//!
//! The solver refreshes per-switch current and per-sector voltage on every
//! feeder of a substation; the constraint checks then read those results
//! back in a fixed priority order.

pub mod constraints;
pub mod solver;

pub use constraints::{available_power, ConstraintKind, RestorationLimits, Violation};
pub use solver::{BackwardForwardSweep, LoadFlowSolver, PowerFlowError};

#[cfg(test)]
pub use solver::MockLoadFlowSolver;
