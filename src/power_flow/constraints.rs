use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::domain::{Topology, TopologyError};

/// Restoration constraints, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
pub enum ConstraintKind {
    #[strum(to_string = "Transformer Capacity")]
    TransformerCapacity,
    #[strum(to_string = "Conductor Ampacity")]
    ConductorAmpacity,
    #[strum(to_string = "Voltage Limits")]
    VoltageLimits,
}

impl ConstraintKind {
    pub fn priority_order() -> impl Iterator<Item = ConstraintKind> {
        ConstraintKind::iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Violation {
    TransformerCapacity {
        substation: String,
        available_va: f64,
    },
    ConductorAmpacity {
        switch: String,
        flow_a: f64,
        ampacity_a: f64,
    },
    Voltage {
        sector: String,
        voltage_v: f64,
        min_v: f64,
        max_v: f64,
    },
    /// The load flow found no operating point; treated as a voltage failure.
    LoadFlowDiverged {
        feeder: String,
        reason: String,
    },
}

impl Violation {
    pub fn kind(&self) -> ConstraintKind {
        match self {
            Self::TransformerCapacity { .. } => ConstraintKind::TransformerCapacity,
            Self::ConductorAmpacity { .. } => ConstraintKind::ConductorAmpacity,
            Self::Voltage { .. } | Self::LoadFlowDiverged { .. } => ConstraintKind::VoltageLimits,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransformerCapacity {
                substation,
                available_va,
            } => write!(f, "substation {substation} short by {:.1} kVA", -available_va / 1e3),
            Self::ConductorAmpacity {
                switch,
                flow_a,
                ampacity_a,
            } => write!(f, "switch {switch} carries {flow_a:.1} A over its {ampacity_a:.1} A rating"),
            Self::Voltage {
                sector,
                voltage_v,
                min_v,
                max_v,
            } => write!(
                f,
                "sector {sector} at {voltage_v:.1} V outside [{min_v:.1}, {max_v:.1}] V"
            ),
            Self::LoadFlowDiverged { feeder, reason } => {
                write!(f, "load flow on feeder {feeder} failed: {reason}")
            }
        }
    }
}

/// Available power margin of a substation: |Σ transformer ratings| − |Σ feeder consumption|.
pub fn available_power(topology: &Topology, substation: &str) -> Result<f64, TopologyError> {
    let sub = topology.substation(substation)?;
    let consumption = topology
        .feeders_of(substation)
        .map(|f| f.total_consumption())
        .sum::<crate::domain::Phasor>();
    Ok(sub.transformer_capacity().magnitude() - consumption.magnitude())
}

/// Operating limits a restored feeder must respect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RestorationLimits {
    /// Allowed per-unit deviation of load-sector voltage from nominal.
    pub voltage_tolerance: f64,
}

impl Default for RestorationLimits {
    fn default() -> Self {
        Self {
            voltage_tolerance: 0.05,
        }
    }
}

impl RestorationLimits {
    /// Check one constraint against the last load-flow results of every
    /// feeder sharing a substation with `feeder`.
    pub fn check(
        &self,
        kind: ConstraintKind,
        topology: &Topology,
        feeder: &str,
    ) -> Result<Option<Violation>, TopologyError> {
        let f = topology.feeder(feeder)?;
        let violation = match kind {
            ConstraintKind::TransformerCapacity => {
                let available_va = available_power(topology, &f.substation)?;
                (available_va < 0.0).then(|| Violation::TransformerCapacity {
                    substation: f.substation.clone(),
                    available_va,
                })
            }
            ConstraintKind::ConductorAmpacity => {
                topology.feeders_of(&f.substation).find_map(|g| {
                    g.conductor_flows.iter().find_map(|(name, flow)| {
                        let ampacity = g.switches.get(name)?.line.ampacity_a;
                        (*flow > ampacity).then(|| Violation::ConductorAmpacity {
                            switch: name.clone(),
                            flow_a: *flow,
                            ampacity_a: ampacity,
                        })
                    })
                })
            }
            ConstraintKind::VoltageLimits => {
                let nominal = topology.substation(&f.substation)?.nominal_voltage_v;
                let min_v = nominal * (1.0 - self.voltage_tolerance);
                let max_v = nominal * (1.0 + self.voltage_tolerance);
                topology.feeders_of(&f.substation).find_map(|g| {
                    g.load_sectors().find_map(|s| {
                        let v = *g.sector_voltages.get(&s.name)?;
                        (v < min_v || v > max_v).then(|| Violation::Voltage {
                            sector: s.name.clone(),
                            voltage_v: v,
                            min_v,
                            max_v,
                        })
                    })
                })
            }
        };
        Ok(violation)
    }

    /// First violated constraint in priority order, if any.
    pub fn first_violation(
        &self,
        topology: &Topology,
        feeder: &str,
    ) -> Result<Option<Violation>, TopologyError> {
        for kind in ConstraintKind::priority_order() {
            if let Some(v) = self.check(kind, topology, feeder)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }
}
