use serde::{Deserialize, Serialize};

use super::Phasor;

/// Switching zone of the network, the unit moved by prune and graft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    pub name: String,
    /// Aggregate demand of the sector's load points (VA).
    #[serde(default)]
    pub load_va: Phasor,
    /// Set on the faulted sector once a trip has been located; a faulted
    /// sector carries no load and is never used as a graft point.
    #[serde(default)]
    pub faulted: bool,
}

impl Sector {
    pub fn new(name: impl Into<String>, load_va: Phasor) -> Self {
        Self {
            name: name.into(),
            load_va,
            faulted: false,
        }
    }

    pub fn is_load(&self) -> bool {
        !self.faulted && self.load_va.magnitude() > 0.0
    }

    pub fn demand(&self) -> Phasor {
        if self.faulted {
            Phasor::ZERO
        } else {
            self.load_va
        }
    }
}

/// Conductor data of the line section behind a switch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    pub resistance_ohm: f64,
    pub reactance_ohm: f64,
    pub ampacity_a: f64,
}

impl LineSegment {
    pub fn impedance(&self) -> Phasor {
        Phasor::new(self.resistance_ohm, self.reactance_ohm)
    }
}

impl Default for LineSegment {
    fn default() -> Self {
        Self {
            resistance_ohm: 0.0,
            reactance_ohm: 0.0,
            ampacity_a: f64::MAX,
        }
    }
}

/// Switch between two sectors. Terminals are plain sector names; a switch
/// never owns the sectors it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    pub name: String,
    pub n1: String,
    pub n2: String,
    pub closed: bool,
    #[serde(default)]
    pub line: LineSegment,
}

impl Switch {
    pub fn new(
        name: impl Into<String>,
        n1: impl Into<String>,
        n2: impl Into<String>,
        closed: bool,
    ) -> Self {
        Self {
            name: name.into(),
            n1: n1.into(),
            n2: n2.into(),
            closed,
            line: LineSegment::default(),
        }
    }

    pub fn with_line(mut self, line: LineSegment) -> Self {
        self.line = line;
        self
    }

    pub fn touches(&self, sector: &str) -> bool {
        self.n1 == sector || self.n2 == sector
    }

    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.n1 == a && self.n2 == b) || (self.n1 == b && self.n2 == a)
    }

    /// Terminal on the other side of `sector`, if the switch touches it.
    pub fn other_terminal(&self, sector: &str) -> Option<&str> {
        if self.n1 == sector {
            Some(&self.n2)
        } else if self.n2 == sector {
            Some(&self.n1)
        } else {
            None
        }
    }

    pub fn terminals(&self) -> [&str; 2] {
        [&self.n1, &self.n2]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformer {
    pub name: String,
    /// Rated apparent power (VA).
    pub rating_va: Phasor,
}

/// Substation bus feeding one or more feeders through its transformers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substation {
    pub name: String,
    /// Nominal line voltage at the bus (V).
    pub nominal_voltage_v: f64,
    pub transformers: Vec<Transformer>,
    pub feeders: Vec<String>,
}

impl Substation {
    pub fn transformer_capacity(&self) -> Phasor {
        self.transformers.iter().map(|t| t.rating_va).sum()
    }
}
