//! Field-device interface for breakers and sectionalising switches.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::domain::Topology;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Unknown breaker: {0}")]
    UnknownBreaker(String),
    #[error("Breaker {0} did not respond to command")]
    CommandFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BreakerPosition {
    Open,
    Closed,
}

impl BreakerPosition {
    pub fn from_closed(closed: bool) -> Self {
        if closed {
            Self::Closed
        } else {
            Self::Open
        }
    }
}

#[async_trait]
pub trait BreakerDriver: Send + Sync {
    async fn position(&self, breaker: &str) -> Result<BreakerPosition, HardwareError>;
    async fn operate(&self, breaker: &str, position: BreakerPosition) -> Result<(), HardwareError>;
}

/// In-memory breakers with optional actuation latency.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBreaker {
    positions: Arc<RwLock<HashMap<String, BreakerPosition>>>,
    jammed: Arc<RwLock<BTreeSet<String>>>,
    latency: Option<Duration>,
}

impl SimulatedBreaker {
    pub fn new<I, S>(breakers: I) -> Self
    where
        I: IntoIterator<Item = (S, BreakerPosition)>,
        S: Into<String>,
    {
        Self {
            positions: Arc::new(RwLock::new(
                breakers.into_iter().map(|(n, p)| (n.into(), p)).collect(),
            )),
            ..Self::default()
        }
    }

    /// One breaker per switch of the network, in its modelled position.
    pub fn from_topology(topology: &Topology) -> Self {
        Self::new(
            topology
                .feeders
                .values()
                .flat_map(|f| f.switches.values())
                .map(|s| (s.name.clone(), BreakerPosition::from_closed(s.closed))),
        )
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every later command on `breaker` fail.
    pub async fn jam(&self, breaker: &str) {
        self.jammed.write().await.insert(breaker.to_string());
    }
}

#[async_trait]
impl BreakerDriver for SimulatedBreaker {
    async fn position(&self, breaker: &str) -> Result<BreakerPosition, HardwareError> {
        self.positions
            .read()
            .await
            .get(breaker)
            .copied()
            .ok_or_else(|| HardwareError::UnknownBreaker(breaker.to_string()))
    }

    async fn operate(&self, breaker: &str, position: BreakerPosition) -> Result<(), HardwareError> {
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }
        if self.jammed.read().await.contains(breaker) {
            return Err(HardwareError::CommandFailed(breaker.to_string()));
        }
        let mut positions = self.positions.write().await;
        let slot = positions
            .get_mut(breaker)
            .ok_or_else(|| HardwareError::UnknownBreaker(breaker.to_string()))?;
        *slot = position;
        debug!(%breaker, ?position, "Breaker operated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::tests::three_feeders;

    #[tokio::test]
    async fn test_operate_and_read_back() {
        let driver = SimulatedBreaker::from_topology(&three_feeders());
        assert_eq!(driver.position("t1").await.unwrap(), BreakerPosition::Open);
        driver.operate("t1", BreakerPosition::Closed).await.unwrap();
        assert_eq!(driver.position("t1").await.unwrap(), BreakerPosition::Closed);
    }

    #[tokio::test]
    async fn test_unknown_and_jammed_breakers() {
        let driver = SimulatedBreaker::new([("ch1", BreakerPosition::Closed)])
            .with_latency(Duration::from_millis(1));
        assert!(matches!(
            driver.operate("zz", BreakerPosition::Open).await,
            Err(HardwareError::UnknownBreaker(_))
        ));
        driver.jam("ch1").await;
        assert!(matches!(
            driver.operate("ch1", BreakerPosition::Open).await,
            Err(HardwareError::CommandFailed(_))
        ));
        assert_eq!(driver.position("ch1").await.unwrap(), BreakerPosition::Closed);
    }
}
