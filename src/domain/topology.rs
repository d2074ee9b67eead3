use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

use super::{Feeder, LineSegment, Phasor, Rnp, RnpEntry, Sector, Substation, Switch, Transformer};

/// Topology model errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Unknown sector: {0}")]
    UnknownSector(String),
    #[error("Unknown switch: {0}")]
    UnknownSwitch(String),
    #[error("Unknown feeder: {0}")]
    UnknownFeeder(String),
    #[error("Unknown substation: {0}")]
    UnknownSubstation(String),
    #[error("Sector {0} is a feeder root and cannot be pruned")]
    RootPrune(String),
    #[error("Sector {0} is faulted")]
    FaultedSector(String),
    #[error("No switch joins {target} to branch root {root}")]
    NoGraftSwitch { target: String, root: String },
    #[error("Invalid node-depth sequence: {0}")]
    InvalidRnp(String),
    #[error("Sector {0} appears more than once")]
    DuplicateSector(String),
    #[error("Failed to read topology file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid topology file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Every feeder and substation of the network as seen by one agent: its own
/// feeder is authoritative, the rest are replicas kept in step by sync events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub substations: BTreeMap<String, Substation>,
    pub feeders: BTreeMap<String, Feeder>,
}

impl Topology {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, TopologyError> {
        let file: TopologyFile = toml::from_str(raw)?;
        Self::from_file(file)
    }

    pub fn feeder(&self, name: &str) -> Result<&Feeder, TopologyError> {
        self.feeders
            .get(name)
            .ok_or_else(|| TopologyError::UnknownFeeder(name.to_string()))
    }

    pub fn feeder_mut(&mut self, name: &str) -> Result<&mut Feeder, TopologyError> {
        self.feeders
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownFeeder(name.to_string()))
    }

    pub fn substation(&self, name: &str) -> Result<&Substation, TopologyError> {
        self.substations
            .get(name)
            .ok_or_else(|| TopologyError::UnknownSubstation(name.to_string()))
    }

    pub fn substation_of(&self, feeder: &str) -> Result<&Substation, TopologyError> {
        let feeder = self.feeder(feeder)?;
        self.substation(&feeder.substation)
    }

    pub fn feeders_of<'a>(&'a self, substation: &'a str) -> impl Iterator<Item = &'a Feeder> + 'a {
        self.feeders
            .values()
            .filter(move |f| f.substation == substation)
    }

    pub fn feeder_of_sector(&self, sector: &str) -> Option<&str> {
        self.feeders
            .values()
            .find(|f| f.contains(sector))
            .map(|f| f.name.as_str())
    }

    /// Check the node-depth invariant of every feeder.
    pub fn validate(&self) -> Result<(), TopologyError> {
        for feeder in self.feeders.values() {
            feeder.rnp.validate()?;
            for entry in feeder.rnp.iter() {
                if !feeder.sectors.contains_key(&entry.sector) {
                    return Err(TopologyError::UnknownSector(entry.sector.clone()));
                }
            }
        }
        Ok(())
    }

    fn from_file(file: TopologyFile) -> Result<Self, TopologyError> {
        let mut substations: BTreeMap<String, Substation> = file
            .substations
            .into_iter()
            .map(|s| {
                (
                    s.name.clone(),
                    Substation {
                        name: s.name,
                        nominal_voltage_v: s.nominal_voltage_v,
                        transformers: s
                            .transformers
                            .into_iter()
                            .map(|t| Transformer {
                                name: t.name,
                                rating_va: Phasor::real(t.rating_kva * 1e3),
                            })
                            .collect(),
                        feeders: Vec::new(),
                    },
                )
            })
            .collect();

        let switches: Vec<Switch> = file.switches.into_iter().map(SwitchSpec::into_switch).collect();

        let mut feeders = BTreeMap::new();
        for spec in file.feeders {
            let substation = substations
                .get_mut(&spec.substation)
                .ok_or_else(|| TopologyError::UnknownSubstation(spec.substation.clone()))?;
            substation.feeders.push(spec.name.clone());

            let sectors: BTreeMap<String, Sector> = spec
                .sectors
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        Sector::new(&s.name, Phasor::from_apparent(s.load_kva * 1e3, s.power_factor)),
                    )
                })
                .collect();
            let feeder_switches: BTreeMap<String, Switch> = switches
                .iter()
                .filter(|sw| sw.terminals().iter().any(|t| sectors.contains_key(*t)))
                .map(|sw| (sw.name.clone(), sw.clone()))
                .collect();
            let rnp = build_rnp(&spec.root, &sectors, &switches)?;

            feeders.insert(
                spec.name.clone(),
                Feeder {
                    name: spec.name,
                    substation: spec.substation,
                    rnp,
                    sectors,
                    switches: feeder_switches,
                    conductor_flows: BTreeMap::new(),
                    sector_voltages: BTreeMap::new(),
                },
            );
        }

        let topology = Self {
            substations,
            feeders,
        };
        topology.validate()?;
        Ok(topology)
    }
}

/// Depth-first walk from `root` across closed switches whose terminals both
/// lie in `sectors`. Children follow switch declaration order.
fn build_rnp(
    root: &str,
    sectors: &BTreeMap<String, Sector>,
    switches: &[Switch],
) -> Result<Rnp, TopologyError> {
    if !sectors.contains_key(root) {
        return Err(TopologyError::UnknownSector(root.to_string()));
    }
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut entries = Vec::with_capacity(sectors.len());
    let mut stack = vec![(root, 0usize)];
    while let Some((sector, depth)) = stack.pop() {
        if !visited.insert(sector) {
            return Err(TopologyError::InvalidRnp(format!(
                "closed switches form a loop through sector {sector}"
            )));
        }
        entries.push(RnpEntry::new(depth, sector));
        let children: Vec<&str> = switches
            .iter()
            .filter(|sw| sw.closed)
            .filter_map(|sw| sw.other_terminal(sector))
            .filter(|n| sectors.contains_key(*n) && !visited.contains(n))
            .collect();
        for child in children.into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    if let Some(orphan) = sectors.keys().find(|s| !visited.contains(s.as_str())) {
        return Err(TopologyError::InvalidRnp(format!(
            "sector {orphan} is not reachable from root {root}"
        )));
    }
    Rnp::from_entries(entries)
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    substations: Vec<SubstationSpec>,
    feeders: Vec<FeederSpec>,
    #[serde(default)]
    switches: Vec<SwitchSpec>,
}

#[derive(Debug, Deserialize)]
struct SubstationSpec {
    name: String,
    nominal_voltage_v: f64,
    transformers: Vec<TransformerSpec>,
}

#[derive(Debug, Deserialize)]
struct TransformerSpec {
    name: String,
    rating_kva: f64,
}

#[derive(Debug, Deserialize)]
struct FeederSpec {
    name: String,
    substation: String,
    root: String,
    sectors: Vec<SectorSpec>,
}

#[derive(Debug, Deserialize)]
struct SectorSpec {
    name: String,
    #[serde(default)]
    load_kva: f64,
    #[serde(default = "default_power_factor")]
    power_factor: f64,
}

#[derive(Debug, Deserialize)]
struct SwitchSpec {
    name: String,
    n1: String,
    n2: String,
    #[serde(default = "default_closed")]
    closed: bool,
    #[serde(default)]
    resistance_ohm: f64,
    #[serde(default)]
    reactance_ohm: f64,
    ampacity_a: Option<f64>,
}

impl SwitchSpec {
    fn into_switch(self) -> Switch {
        let line = LineSegment {
            resistance_ohm: self.resistance_ohm,
            reactance_ohm: self.reactance_ohm,
            ampacity_a: self.ampacity_a.unwrap_or(f64::MAX),
        };
        Switch::new(self.name, self.n1, self.n2, self.closed).with_line(line)
    }
}

fn default_power_factor() -> f64 {
    0.92
}

fn default_closed() -> bool {
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two substations, three feeders. S1_AL1 is a chain R1-1-2-3-4; sector 4
    /// ties to S1_AL2 through the open switch `t1`. S2_AL1 has no tie at all.
    pub(crate) const THREE_FEEDERS: &str = r#"
        [[substations]]
        name = "S1"
        nominal_voltage_v = 13800.0
        transformers = [{ name = "T1", rating_kva = 10000.0 }]

        [[substations]]
        name = "S2"
        nominal_voltage_v = 13800.0
        transformers = [{ name = "T2", rating_kva = 5000.0 }]

        [[feeders]]
        name = "S1_AL1"
        substation = "S1"
        root = "R1"
        sectors = [
            { name = "R1" },
            { name = "1", load_kva = 300.0 },
            { name = "2", load_kva = 300.0 },
            { name = "3", load_kva = 250.0 },
            { name = "4", load_kva = 250.0 },
        ]

        [[feeders]]
        name = "S1_AL2"
        substation = "S1"
        root = "R2"
        sectors = [
            { name = "R2" },
            { name = "A", load_kva = 400.0 },
        ]

        [[feeders]]
        name = "S2_AL1"
        substation = "S2"
        root = "R3"
        sectors = [
            { name = "R3" },
            { name = "B", load_kva = 400.0 },
        ]

        [[switches]]
        name = "ch0"
        n1 = "R1"
        n2 = "1"
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 400.0

        [[switches]]
        name = "ch1"
        n1 = "1"
        n2 = "2"
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 400.0

        [[switches]]
        name = "ch2"
        n1 = "2"
        n2 = "3"
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 300.0

        [[switches]]
        name = "ch3"
        n1 = "3"
        n2 = "4"
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 300.0

        [[switches]]
        name = "ch4"
        n1 = "R2"
        n2 = "A"
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 400.0

        [[switches]]
        name = "ch5"
        n1 = "R3"
        n2 = "B"
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 400.0

        [[switches]]
        name = "t1"
        n1 = "4"
        n2 = "A"
        closed = false
        resistance_ohm = 0.2
        reactance_ohm = 0.3
        ampacity_a = 300.0
    "#;

    pub(crate) fn three_feeders() -> Topology {
        Topology::from_toml_str(THREE_FEEDERS).unwrap()
    }

    #[test]
    fn test_load_builds_node_depth_trees() {
        let topo = three_feeders();
        let al1 = topo.feeder("S1_AL1").unwrap();
        assert_eq!(al1.rnp.to_string(), "[0:R1 1:1 2:2 3:3 4:4]");
        assert_eq!(topo.feeder("S1_AL2").unwrap().rnp.to_string(), "[0:R2 1:A]");
        assert_eq!(topo.substation("S1").unwrap().feeders, vec!["S1_AL1", "S1_AL2"]);
    }

    #[test]
    fn test_tie_switch_shared_by_both_feeders() {
        let topo = three_feeders();
        assert!(topo.feeder("S1_AL1").unwrap().switches.contains_key("t1"));
        assert!(topo.feeder("S1_AL2").unwrap().switches.contains_key("t1"));
        assert!(!topo.feeder("S2_AL1").unwrap().switches.contains_key("t1"));
    }

    #[test]
    fn test_feeder_of_sector() {
        let topo = three_feeders();
        assert_eq!(topo.feeder_of_sector("3"), Some("S1_AL1"));
        assert_eq!(topo.feeder_of_sector("B"), Some("S2_AL1"));
        assert_eq!(topo.feeder_of_sector("nope"), None);
    }

    #[test]
    fn test_unreachable_sector_is_rejected() {
        let raw = r#"
            [[substations]]
            name = "S"
            nominal_voltage_v = 400.0
            transformers = []

            [[feeders]]
            name = "F"
            substation = "S"
            root = "R"
            sectors = [{ name = "R" }, { name = "island" }]
        "#;
        assert!(matches!(
            Topology::from_toml_str(raw),
            Err(TopologyError::InvalidRnp(_))
        ));
    }

    #[test]
    fn test_unknown_substation_is_rejected() {
        let raw = r#"
            substations = []

            [[feeders]]
            name = "F"
            substation = "ghost"
            root = "R"
            sectors = [{ name = "R" }]
        "#;
        assert!(matches!(
            Topology::from_toml_str(raw),
            Err(TopologyError::UnknownSubstation(_))
        ));
    }
}
