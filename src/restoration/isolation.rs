use tracing::{debug, info};

use crate::domain::{Feeder, PrunedBranch, TopologyError};

/// Where a trip puts the fault, and which switches cut it off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultLocation {
    pub tripped_switch: String,
    /// Terminal of the tripped switch farther from the feeder root.
    pub faulted_sector: String,
    /// Every switch with a terminal on the faulted sector, by name.
    pub isolation_switches: Vec<String>,
}

/// Locate the faulted sector behind `tripped_switch`. Read-only.
pub fn locate_fault(feeder: &Feeder, tripped_switch: &str) -> Result<FaultLocation, TopologyError> {
    let switch = feeder
        .switches
        .get(tripped_switch)
        .ok_or_else(|| TopologyError::UnknownSwitch(tripped_switch.to_string()))?;
    let depths = feeder.depth_map();

    let faulted = match (depths.get(&switch.n1), depths.get(&switch.n2)) {
        (Some(d1), Some(d2)) if d2 > d1 => &switch.n2,
        (Some(_), _) => &switch.n1,
        (None, Some(_)) => &switch.n2,
        (None, None) => return Err(TopologyError::UnknownSector(switch.n1.clone())),
    };

    let isolation_switches = feeder
        .switches
        .values()
        .filter(|s| s.touches(faulted))
        .map(|s| s.name.clone())
        .collect();

    Ok(FaultLocation {
        tripped_switch: tripped_switch.to_string(),
        faulted_sector: faulted.clone(),
        isolation_switches,
    })
}

/// Result of isolating a fault on the feeder model.
#[derive(Debug, Clone, PartialEq)]
pub struct Isolation {
    pub location: FaultLocation,
    /// Subtrees detached downstream of the faulted sector.
    pub branches: Vec<PrunedBranch>,
}

impl Isolation {
    pub fn pruned_roots(&self) -> Vec<String> {
        self.branches.iter().map(|b| b.root().to_string()).collect()
    }
}

/// Open every isolation switch, flag the faulted sector, and prune each
/// subtree hanging below it.
pub fn isolate(feeder: &mut Feeder, location: &FaultLocation) -> Result<Isolation, TopologyError> {
    let depths = feeder.depth_map();
    let fault_depth = *depths
        .get(&location.faulted_sector)
        .ok_or_else(|| TopologyError::UnknownSector(location.faulted_sector.clone()))?;

    let mut branches = Vec::new();
    for name in &location.isolation_switches {
        let far = feeder
            .switches
            .get(name)
            .and_then(|s| s.other_terminal(&location.faulted_sector))
            .map(str::to_string)
            .ok_or_else(|| TopologyError::UnknownSwitch(name.clone()))?;
        feeder.set_switch(name, false)?;

        match depths.get(&far) {
            Some(d) if *d > fault_depth && feeder.contains(&far) => {
                let branch = feeder.prune(&far)?;
                debug!(feeder = %feeder.name, switch = %name, root = %far, sectors = branch.len(), "Pruned downstream branch");
                branches.push(branch);
            }
            _ => debug!(feeder = %feeder.name, switch = %name, "Opened isolation switch"),
        }
    }
    feeder.mark_faulted(&location.faulted_sector)?;

    info!(
        feeder = %feeder.name,
        sector = %location.faulted_sector,
        branches = branches.len(),
        "Fault isolated"
    );
    Ok(Isolation {
        location: location.clone(),
        branches,
    })
}
