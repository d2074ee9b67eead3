//! Node-depth representation (RNP) of a radial feeder.
//!
//! A feeder tree is stored as its pre-order traversal: a sequence of
//! `(depth, sector)` pairs where the root sits at depth 0 and the subtree of
//! any sector is the contiguous run right after it whose depths are strictly
//! greater than the sector's own depth. Prune and graft therefore reduce to
//! removing and inserting contiguous runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Range;

use super::topology::TopologyError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RnpEntry {
    pub depth: usize,
    pub sector: String,
}

impl RnpEntry {
    pub fn new(depth: usize, sector: impl Into<String>) -> Self {
        Self {
            depth,
            sector: sector.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rnp {
    entries: Vec<RnpEntry>,
}

impl Rnp {
    /// Build from raw entries, rejecting sequences that are not a valid pre-order.
    pub fn from_entries(entries: Vec<RnpEntry>) -> Result<Self, TopologyError> {
        let rnp = Self { entries };
        rnp.validate()?;
        Ok(rnp)
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = (usize, &'a str)>,
    {
        Self::from_entries(
            pairs
                .into_iter()
                .map(|(depth, sector)| RnpEntry::new(depth, sector))
                .collect(),
        )
    }

    pub fn entries(&self) -> &[RnpEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &RnpEntry> {
        self.entries.iter()
    }

    pub fn sectors(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.sector.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn root(&self) -> Option<&str> {
        self.entries.first().map(|e| e.sector.as_str())
    }

    pub fn position(&self, sector: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.sector == sector)
    }

    pub fn contains(&self, sector: &str) -> bool {
        self.position(sector).is_some()
    }

    pub fn depth_of(&self, sector: &str) -> Option<usize> {
        self.position(sector).map(|i| self.entries[i].depth)
    }

    /// Sector name to depth, the `rnpAsDepthMap` view used by fault lookup.
    pub fn depth_map(&self) -> BTreeMap<String, usize> {
        self.entries
            .iter()
            .map(|e| (e.sector.clone(), e.depth))
            .collect()
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.entries.iter().map(|e| e.depth).max()
    }

    pub fn sectors_at_depth(&self, depth: usize) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.depth == depth)
            .map(|e| e.sector.as_str())
            .collect()
    }

    /// Index range covering `sector` and all of its descendants.
    pub fn subtree_range(&self, sector: &str) -> Option<Range<usize>> {
        let start = self.position(sector)?;
        let depth = self.entries[start].depth;
        let len = self.entries[start + 1..]
            .iter()
            .take_while(|e| e.depth > depth)
            .count();
        Some(start..start + 1 + len)
    }

    /// Copy of the subtree rooted at `sector`, re-based so the root has depth 0.
    pub fn subtree(&self, sector: &str) -> Option<Rnp> {
        let range = self.subtree_range(sector)?;
        Some(Self::rebased(&self.entries[range]))
    }

    /// Remove the subtree rooted at `sector`, returning it re-based to depth 0.
    pub fn excise(&mut self, sector: &str) -> Option<Rnp> {
        let range = self.subtree_range(sector)?;
        let removed: Vec<RnpEntry> = self.entries.drain(range).collect();
        Some(Self::rebased(&removed))
    }

    /// Insert `branch` as a child subtree of `parent`, shifting its depths to
    /// `depth(parent) + 1`.
    pub fn splice(&mut self, parent: &str, branch: &Rnp) -> Result<(), TopologyError> {
        branch.validate()?;
        let at = self
            .position(parent)
            .ok_or_else(|| TopologyError::UnknownSector(parent.to_string()))?;
        if let Some(dup) = branch.sectors().find(|s| self.contains(s)) {
            return Err(TopologyError::DuplicateSector(dup.to_string()));
        }
        let offset = self.entries[at].depth + 1;
        let shifted = branch
            .entries
            .iter()
            .map(|e| RnpEntry::new(e.depth + offset, e.sector.clone()));
        self.entries.splice(at + 1..at + 1, shifted);
        Ok(())
    }

    pub fn parent_of(&self, sector: &str) -> Option<&str> {
        let at = self.position(sector)?;
        let depth = self.entries[at].depth;
        if depth == 0 {
            return None;
        }
        self.entries[..at]
            .iter()
            .rev()
            .find(|e| e.depth == depth - 1)
            .map(|e| e.sector.as_str())
    }

    pub fn children_of(&self, sector: &str) -> Vec<&str> {
        let Some(range) = self.subtree_range(sector) else {
            return Vec::new();
        };
        let child_depth = self.entries[range.start].depth + 1;
        self.entries[range.start + 1..range.end]
            .iter()
            .filter(|e| e.depth == child_depth)
            .map(|e| e.sector.as_str())
            .collect()
    }

    /// Re-orient the tree so `new_root` becomes its root.
    ///
    /// Children keep their relative order; the former parent of each node on
    /// the path to the old root is appended as that node's last child.
    pub fn rerooted(&self, new_root: &str) -> Option<Rnp> {
        let start = self.position(new_root)?;
        let n = self.entries.len();
        let mut parent: Vec<Option<usize>> = vec![None; n];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut stack: Vec<usize> = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            while let Some(&top) = stack.last() {
                if self.entries[top].depth < entry.depth {
                    break;
                }
                stack.pop();
            }
            if let Some(&p) = stack.last() {
                parent[i] = Some(p);
                children[p].push(i);
            }
            stack.push(i);
        }

        let mut visited = vec![false; n];
        let mut out = Vec::with_capacity(n);
        let mut work = vec![(start, 0usize)];
        while let Some((node, depth)) = work.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            out.push(RnpEntry::new(depth, self.entries[node].sector.clone()));
            let mut neighbours: Vec<usize> = children[node].clone();
            neighbours.extend(parent[node]);
            for next in neighbours.into_iter().rev() {
                if !visited[next] {
                    work.push((next, depth + 1));
                }
            }
        }
        Some(Rnp { entries: out })
    }

    /// Check the pre-order depth invariant: a single depth-0 root first, every
    /// later depth in `1..=previous + 1`, and unique sector names.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let Some(first) = self.entries.first() else {
            return Ok(());
        };
        if first.depth != 0 {
            return Err(TopologyError::InvalidRnp(format!(
                "root '{}' has depth {}",
                first.sector, first.depth
            )));
        }
        let mut seen = HashSet::with_capacity(self.entries.len());
        let mut prev = 0usize;
        for entry in &self.entries {
            if !seen.insert(entry.sector.as_str()) {
                return Err(TopologyError::DuplicateSector(entry.sector.clone()));
            }
            if entry.depth > prev + 1 {
                return Err(TopologyError::InvalidRnp(format!(
                    "sector '{}' jumps from depth {} to {}",
                    entry.sector, prev, entry.depth
                )));
            }
            prev = entry.depth;
        }
        if self.entries[1..].iter().any(|e| e.depth == 0) {
            return Err(TopologyError::InvalidRnp(
                "more than one depth-0 entry".to_string(),
            ));
        }
        Ok(())
    }

    fn rebased(run: &[RnpEntry]) -> Rnp {
        let base = run.first().map(|e| e.depth).unwrap_or(0);
        Rnp {
            entries: run
                .iter()
                .map(|e| RnpEntry::new(e.depth - base, e.sector.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for Rnp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}:{}", e.depth, e.sector))
            .collect();
        write!(f, "[{}]", parts.join(" "))
    }
}
