use anyhow::Result;
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::power_flow::{BackwardForwardSweep, RestorationLimits};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub agents: AgentsConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub restoration: RestorationConfig,
    #[serde(default)]
    pub power_flow: PowerFlowConfig,
    #[serde(default)]
    pub fault: Option<FaultConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig { pub topology_file: PathBuf }
impl Default for NetworkConfig {
    fn default() -> Self {
        Self { topology_file: PathBuf::from("config/topology.toml") }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Feeder agents; each is named after the feeder it owns.
    pub feeders: Vec<String>,
    #[serde(default)]
    pub devices: Vec<DeviceAgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceAgentConfig {
    pub name: String,
    pub feeder: String,
}

impl AgentsConfig {
    pub fn device_for(&self, feeder: &str) -> Option<&DeviceAgentConfig> {
        self.devices.iter().find(|d| d.feeder == feeder)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    pub bid_timeout_ms: u64,
    pub cfp_settle_ms: u64,
    pub sync_retry_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { bid_timeout_ms: 10_000, cfp_settle_ms: 1_000, sync_retry_ms: 1_000 }
    }
}

impl NegotiationConfig {
    pub fn bid_timeout(&self) -> Duration { Duration::from_millis(self.bid_timeout_ms) }
    pub fn cfp_settle(&self) -> Duration { Duration::from_millis(self.cfp_settle_ms) }
    pub fn sync_retry(&self) -> Duration { Duration::from_millis(self.sync_retry_ms) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorationConfig { pub voltage_tolerance: f64 }
impl Default for RestorationConfig {
    fn default() -> Self {
        Self { voltage_tolerance: RestorationLimits::default().voltage_tolerance }
    }
}
impl RestorationConfig {
    pub fn limits(&self) -> RestorationLimits {
        RestorationLimits { voltage_tolerance: self.voltage_tolerance }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowConfig { pub max_iterations: usize, pub tolerance_v: f64 }
impl Default for PowerFlowConfig {
    fn default() -> Self {
        let sweep = BackwardForwardSweep::default();
        Self { max_iterations: sweep.max_iterations, tolerance_v: sweep.tolerance_v }
    }
}
impl PowerFlowConfig {
    pub fn solver(&self) -> BackwardForwardSweep {
        BackwardForwardSweep::new(self.max_iterations, self.tolerance_v)
    }
}

/// Scripted trip for the protection relay simulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FaultConfig {
    pub switch: String,
    /// Device agent that receives the trip notice.
    pub device: String,
    #[serde(default)]
    pub delay_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("SHG__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }
}
