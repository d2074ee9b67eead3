use thiserror::Error;
use tracing::{debug, trace};

use crate::domain::{Feeder, Phasor, Topology, TopologyError};

#[derive(Debug, Error)]
pub enum PowerFlowError {
    #[error("Unknown substation: {0}")]
    UnknownSubstation(String),
    #[error("Load flow on feeder {feeder} did not converge after {iterations} iterations (mismatch {mismatch_v:.4} V)")]
    NotConverged {
        feeder: String,
        iterations: usize,
        mismatch_v: f64,
    },
    #[error("Voltage at sector {0} collapsed or is not finite")]
    VoltageCollapse(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Load-flow contract consumed by restoration: refresh every feeder of
/// `substation` with per-switch current magnitudes and per-sector voltages.
#[cfg_attr(test, mockall::automock)]
pub trait LoadFlowSolver: Send + Sync {
    fn solve(&self, topology: &mut Topology, substation: &str) -> Result<(), PowerFlowError>;
}

/// Backward/forward sweep for radial feeders with constant-power loads.
///
/// Works on per-phase equivalents of a balanced three-phase network: the
/// source is the substation phase voltage, loads are a third of the sector
/// demand, and each sector is reached through the line data of the switch
/// feeding it.
#[derive(Debug, Clone)]
pub struct BackwardForwardSweep {
    pub max_iterations: usize,
    /// Largest per-iteration voltage change (V) accepted as converged.
    pub tolerance_v: f64,
}

impl Default for BackwardForwardSweep {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance_v: 1e-3,
        }
    }
}

impl BackwardForwardSweep {
    pub fn new(max_iterations: usize, tolerance_v: f64) -> Self {
        Self {
            max_iterations,
            tolerance_v,
        }
    }

    fn solve_feeder(&self, feeder: &mut Feeder, nominal_v: f64) -> Result<(), PowerFlowError> {
        let entries = feeder.rnp.entries();
        let n = entries.len();
        if n == 0 {
            return Ok(());
        }

        let parents = parent_indices(feeder);
        let source = Phasor::real(nominal_v / 3f64.sqrt());
        let loads: Vec<Phasor> = entries
            .iter()
            .map(|e| {
                feeder
                    .sectors
                    .get(&e.sector)
                    .map(|s| s.demand().scale(1.0 / 3.0))
                    .unwrap_or(Phasor::ZERO)
            })
            .collect();
        let impedances: Vec<Phasor> = entries
            .iter()
            .map(|e| {
                feeder
                    .feeding_switch(&e.sector)
                    .map(|s| s.line.impedance())
                    .unwrap_or(Phasor::ZERO)
            })
            .collect();

        let mut voltages = vec![source; n];
        let mut currents = vec![Phasor::ZERO; n];
        let mut converged = false;
        let mut mismatch = f64::MAX;
        let mut iterations = 0;

        while iterations < self.max_iterations {
            iterations += 1;

            // Backward: accumulate branch currents from the leaves up.
            for (i, load) in loads.iter().enumerate() {
                currents[i] = (*load / voltages[i]).conj();
            }
            for i in (1..n).rev() {
                if let Some(p) = parents[i] {
                    let carried = currents[i];
                    currents[p] += carried;
                }
            }

            // Forward: drop voltage along each feeding line.
            mismatch = 0.0;
            for i in 1..n {
                let Some(p) = parents[i] else { continue };
                let v = voltages[p] - impedances[i] * currents[i];
                if !v.is_finite() || v.magnitude() <= f64::EPSILON {
                    return Err(PowerFlowError::VoltageCollapse(entries[i].sector.clone()));
                }
                mismatch = f64::max(mismatch, (v - voltages[i]).magnitude());
                voltages[i] = v;
            }

            trace!(feeder = %feeder.name, iteration = iterations, mismatch_v = mismatch, "Sweep");
            if mismatch < self.tolerance_v {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(PowerFlowError::NotConverged {
                feeder: feeder.name.clone(),
                iterations,
                mismatch_v: mismatch,
            });
        }

        let mut flows = std::collections::BTreeMap::new();
        let mut sector_voltages = std::collections::BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            sector_voltages.insert(entry.sector.clone(), voltages[i].magnitude() * 3f64.sqrt());
            if let Some(switch) = feeder.feeding_switch(&entry.sector) {
                flows.insert(switch.name.clone(), currents[i].magnitude());
            }
        }
        debug!(feeder = %feeder.name, iterations, "Load flow converged");
        feeder.conductor_flows = flows;
        feeder.sector_voltages = sector_voltages;
        Ok(())
    }
}

impl LoadFlowSolver for BackwardForwardSweep {
    fn solve(&self, topology: &mut Topology, substation: &str) -> Result<(), PowerFlowError> {
        let sub = topology
            .substations
            .get(substation)
            .ok_or_else(|| PowerFlowError::UnknownSubstation(substation.to_string()))?;
        let nominal_v = sub.nominal_voltage_v;

        for feeder in topology
            .feeders
            .values_mut()
            .filter(|f| f.substation == substation)
        {
            self.solve_feeder(feeder, nominal_v)?;
        }
        Ok(())
    }
}

/// Index of each entry's parent in the feeder's node-depth sequence.
fn parent_indices(feeder: &Feeder) -> Vec<Option<usize>> {
    let entries = feeder.rnp.entries();
    let mut parents = vec![None; entries.len()];
    let mut path: Vec<usize> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        path.truncate(entry.depth);
        parents[i] = path.last().copied();
        path.push(i);
    }
    parents
}
