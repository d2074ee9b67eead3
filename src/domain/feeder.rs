use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{Phasor, PrunedBranch, Rnp, Sector, Switch, TopologyError};

/// One feeder's live tree plus the quantities the load flow derives for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feeder {
    pub name: String,
    pub substation: String,
    pub rnp: Rnp,
    pub sectors: BTreeMap<String, Sector>,
    /// Switches with at least one terminal in this feeder, tie switches included.
    pub switches: BTreeMap<String, Switch>,
    /// Current magnitude through each tree switch (A), keyed by switch name.
    #[serde(default)]
    pub conductor_flows: BTreeMap<String, f64>,
    /// Line voltage magnitude per sector (V).
    #[serde(default)]
    pub sector_voltages: BTreeMap<String, f64>,
}

impl Feeder {
    pub fn root(&self) -> Option<&str> {
        self.rnp.root()
    }

    pub fn contains(&self, sector: &str) -> bool {
        self.sectors.contains_key(sector)
    }

    pub fn depth_map(&self) -> BTreeMap<String, usize> {
        self.rnp.depth_map()
    }

    pub fn load_sectors(&self) -> impl Iterator<Item = &Sector> {
        self.sectors.values().filter(|s| s.is_load())
    }

    /// Sum of the demand of every energisable sector in the tree.
    pub fn total_consumption(&self) -> Phasor {
        self.sectors.values().map(Sector::demand).sum()
    }

    pub fn switch_between(&self, a: &str, b: &str) -> Option<&Switch> {
        self.switches.values().find(|s| s.connects(a, b))
    }

    /// Switch linking `sector` to its parent in the tree.
    pub fn feeding_switch(&self, sector: &str) -> Option<&Switch> {
        let parent = self.rnp.parent_of(sector)?;
        self.switch_between(parent, sector)
    }

    pub fn set_switch(&mut self, name: &str, closed: bool) -> Result<(), TopologyError> {
        let switch = self
            .switches
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownSwitch(name.to_string()))?;
        switch.closed = closed;
        Ok(())
    }

    pub fn mark_faulted(&mut self, sector: &str) -> Result<(), TopologyError> {
        let s = self
            .sectors
            .get_mut(sector)
            .ok_or_else(|| TopologyError::UnknownSector(sector.to_string()))?;
        s.faulted = true;
        Ok(())
    }

    /// Build the branch a prune at `sector` would produce, leaving the feeder untouched.
    pub fn preview_prune(&self, sector: &str) -> Result<PrunedBranch, TopologyError> {
        let rnp = self
            .rnp
            .subtree(sector)
            .ok_or_else(|| TopologyError::UnknownSector(sector.to_string()))?;
        if self.rnp.depth_of(sector) == Some(0) {
            return Err(TopologyError::RootPrune(sector.to_string()));
        }

        let names: BTreeSet<&str> = rnp.sectors().collect();
        let root_switch = self.feeding_switch(sector).map(|s| s.name.clone());

        let sectors = names
            .iter()
            .filter_map(|n| self.sectors.get(*n))
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        let switches = self
            .switches
            .values()
            .filter(|s| s.terminals().iter().any(|t| names.contains(t)))
            .map(|s| {
                let mut s = s.clone();
                if root_switch.as_deref() == Some(s.name.as_str()) {
                    s.closed = false;
                }
                (s.name.clone(), s)
            })
            .collect();

        Ok(PrunedBranch {
            origin_feeder: self.name.clone(),
            sectors,
            rnp,
            root_switch,
            switches,
        })
    }

    /// Detach the subtree rooted at `sector`: opens its feeding switch, removes
    /// its node-depth run, and drops sectors and switches no longer attached.
    pub fn prune(&mut self, sector: &str) -> Result<PrunedBranch, TopologyError> {
        let branch = self.preview_prune(sector)?;

        if let Some(name) = &branch.root_switch {
            self.set_switch(name, false)?;
        }
        self.rnp.excise(sector);
        for name in branch.sectors.keys() {
            self.sectors.remove(name);
            self.sector_voltages.remove(name);
        }

        let remaining = &self.sectors;
        let detached: Vec<String> = self
            .switches
            .values()
            .filter(|s| !s.terminals().iter().any(|t| remaining.contains_key(*t)))
            .map(|s| s.name.clone())
            .collect();
        for name in detached {
            self.switches.remove(&name);
        }
        for name in branch.switches.keys() {
            self.conductor_flows.remove(name);
        }

        Ok(branch)
    }

    /// Splice `branch` under `target`, re-rooting it at `branch_root`, and
    /// close the switch joining the two. Returns the name of that switch.
    pub fn graft(
        &mut self,
        target: &str,
        branch: PrunedBranch,
        branch_root: &str,
    ) -> Result<String, TopologyError> {
        let target_sector = self
            .sectors
            .get(target)
            .ok_or_else(|| TopologyError::UnknownSector(target.to_string()))?;
        if target_sector.faulted {
            return Err(TopologyError::FaultedSector(target.to_string()));
        }
        if !branch.contains(branch_root) {
            return Err(TopologyError::UnknownSector(branch_root.to_string()));
        }

        let tie = self
            .switch_between(target, branch_root)
            .or_else(|| branch.switches.values().find(|s| s.connects(target, branch_root)))
            .map(|s| s.name.clone())
            .ok_or_else(|| TopologyError::NoGraftSwitch {
                target: target.to_string(),
                root: branch_root.to_string(),
            })?;

        let rnp = branch
            .rnp
            .rerooted(branch_root)
            .ok_or_else(|| TopologyError::UnknownSector(branch_root.to_string()))?;
        self.rnp.splice(target, &rnp)?;

        self.sectors.extend(branch.sectors);
        for (name, switch) in branch.switches {
            self.switches.entry(name).or_insert(switch);
        }
        self.set_switch(&tie, true)?;
        Ok(tie)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// R ─ch0─ 1 ─ch1─ 2 ─ch2─ 3 ─ch3─ 4, plus tie switch `t1` from 4 to `X`
    /// on another feeder.
    pub(crate) fn chain_feeder() -> Feeder {
        let names = ["R", "1", "2", "3", "4"];
        let sectors = names
            .iter()
            .map(|n| (n.to_string(), Sector::new(*n, Phasor::real(100.0))))
            .collect();
        let mut switches: BTreeMap<String, Switch> = (0..4)
            .map(|i| {
                let name = format!("ch{i}");
                (name.clone(), Switch::new(name, names[i], names[i + 1], true))
            })
            .collect();
        switches.insert("t1".into(), Switch::new("t1", "4", "X", false));
        Feeder {
            name: "F1".into(),
            substation: "S1".into(),
            rnp: Rnp::from_pairs([(0, "R"), (1, "1"), (2, "2"), (3, "3"), (4, "4")]).unwrap(),
            sectors,
            switches,
            conductor_flows: BTreeMap::new(),
            sector_voltages: BTreeMap::new(),
        }
    }

    pub(crate) fn single_sector_feeder(name: &str, root: &str) -> Feeder {
        let mut sectors = BTreeMap::new();
        sectors.insert(root.to_string(), Sector::new(root, Phasor::real(50.0)));
        Feeder {
            name: name.into(),
            substation: "S2".into(),
            rnp: Rnp::from_pairs([(0, root)]).unwrap(),
            sectors,
            switches: BTreeMap::new(),
            conductor_flows: BTreeMap::new(),
            sector_voltages: BTreeMap::new(),
        }
    }

    #[test]
    fn test_prune_detaches_subtree() {
        let mut feeder = chain_feeder();
        let branch = feeder.prune("3").unwrap();

        assert_eq!(branch.sector_names(), vec!["3", "4"]);
        assert_eq!(branch.root_switch.as_deref(), Some("ch2"));
        assert!(branch.switches.contains_key("t1"));
        assert!(branch.switches.contains_key("ch3"));
        assert!(!branch.switches["ch2"].closed);

        assert_eq!(feeder.rnp.to_string(), "[0:R 1:1 2:2]");
        assert!(!feeder.contains("3"));
        assert!(!feeder.switches["ch2"].closed);
        assert!(!feeder.switches.contains_key("ch3"));
        assert!(!feeder.switches.contains_key("t1"));
    }

    #[test]
    fn test_preview_prune_leaves_feeder_untouched() {
        let feeder = chain_feeder();
        let before = feeder.clone();
        let branch = feeder.preview_prune("2").unwrap();
        assert_eq!(branch.len(), 3);
        assert_eq!(feeder, before);
    }

    #[test]
    fn test_prune_root_is_rejected() {
        let mut feeder = chain_feeder();
        assert!(matches!(feeder.prune("R"), Err(TopologyError::RootPrune(_))));
        assert!(matches!(feeder.prune("zz"), Err(TopologyError::UnknownSector(_))));
    }

    #[test]
    fn test_graft_reroots_at_tie_sector() {
        let mut source = chain_feeder();
        let branch = source.prune("3").unwrap();

        let mut target = single_sector_feeder("F2", "X");
        target.switches.insert("t1".into(), Switch::new("t1", "4", "X", false));

        let closed = target.graft("X", branch, "4").unwrap();
        assert_eq!(closed, "t1");
        assert!(target.switches["t1"].closed);
        assert_eq!(target.rnp.to_string(), "[0:X 1:4 2:3]");
        assert!(target.contains("3"));
        assert!(target.switches.contains_key("ch2"));
        assert!(!target.switches["ch2"].closed);
    }

    #[test]
    fn test_graft_back_restores_original_tree() {
        let mut feeder = chain_feeder();
        let original = feeder.rnp.clone();
        let branch = feeder.prune("2").unwrap();
        feeder.graft("1", branch, "2").unwrap();
        assert_eq!(feeder.rnp, original);
        assert!(feeder.switches["ch1"].closed);
    }

    #[test]
    fn test_graft_without_switch_fails() {
        let mut source = chain_feeder();
        let branch = source.prune("3").unwrap();
        let mut target = single_sector_feeder("F2", "Y");
        assert!(matches!(
            target.graft("Y", branch, "3"),
            Err(TopologyError::NoGraftSwitch { .. })
        ));
    }

    #[test]
    fn test_total_consumption_skips_faulted() {
        let mut feeder = chain_feeder();
        assert_eq!(feeder.total_consumption(), Phasor::real(500.0));
        feeder.mark_faulted("2").unwrap();
        assert_eq!(feeder.total_consumption(), Phasor::real(400.0));
        assert_eq!(feeder.load_sectors().count(), 4);
    }
}
