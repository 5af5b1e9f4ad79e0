//! Memory bandwidth probe

use async_trait::async_trait;
use futures::future::try_join_all;
use poncos_core::{PoncosError, PoncosResult, Slot, SystemConfig};
use std::sync::Arc;
use tracing::debug;

use crate::channel::{call, AgentChannel};
use crate::messages::{topics, MembwReply, MembwRequest};

/// Measures bandwidth contention on a set of slots
#[async_trait]
pub trait Probe: Send + Sync {
    /// One utilization value in `[0, 1]` per slot of `placement`, same order
    async fn measure(&self, placement: &[Slot]) -> PoncosResult<Vec<f64>>;
}

/// Probe that runs the bandwidth benchmark through the machine agents
pub struct MembwProbe {
    channel: Arc<dyn AgentChannel>,
    machines: Vec<String>,
    system: SystemConfig,
}

impl MembwProbe {
    pub fn new(channel: Arc<dyn AgentChannel>, machines: Vec<String>, system: SystemConfig) -> Self {
        Self {
            channel,
            machines,
            system,
        }
    }

    async fn measure_slot(&self, slot: Slot) -> PoncosResult<f64> {
        let host = self.machines.get(slot.machine).ok_or_else(|| {
            PoncosError::Probe(format!("No machine with index {}", slot.machine))
        })?;
        let request = MembwRequest {
            cores: self.system.slot(slot.slot).cpus.clone(),
        };

        let reply: MembwReply =
            call(self.channel.as_ref(), host, topics::MEMBW_REQUEST, &request).await?;

        if !reply.result.is_finite() {
            return Err(PoncosError::Probe(format!(
                "{} reported a non-finite bandwidth value",
                host
            )));
        }

        // The agent reports the bandwidth still available
        let utilization = (1.0 - reply.result).clamp(0.0, 1.0);
        debug!(
            machine = %host,
            slot = slot.slot,
            available = reply.result,
            utilization = utilization,
            "Bandwidth measured"
        );
        Ok(utilization)
    }
}

#[async_trait]
impl Probe for MembwProbe {
    async fn measure(&self, placement: &[Slot]) -> PoncosResult<Vec<f64>> {
        try_join_all(placement.iter().map(|&slot| self.measure_slot(slot))).await
    }
}
