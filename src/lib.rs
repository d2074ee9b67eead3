pub mod agent;
pub mod config;
pub mod domain;
pub mod hardware;
pub mod power_flow;
pub mod protocol;
pub mod restoration;
pub mod telemetry;
