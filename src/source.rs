//! End-to-end capture pipeline: one call from addresses and a filter to a
//! running engine.

use tracing::info;

use crate::api::Columnar;
use crate::engine::{CaptureEngine, EngineConfig, EngineHandle};
use crate::errors::{Error, Result};
use crate::hw::{Context, FlowPipe, MAX_SEMAPHORES, ReceiveQueue, SemaphoreRing, TrafficFilter};
use crate::sim::Platform;

pub const DEFAULT_RXQ_DESCRIPTORS: u32 = 8192;

/// Everything a pipeline is built from. Read once at launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub nic_address: String,
    pub gpu_address: String,
    /// Source address to capture from; empty for any.
    pub source_ip: String,
    /// `tcp` or `udp`.
    pub transport: String,
    pub semaphore_capacity: u16,
    pub rxq_descriptors: u32,
    pub engine: EngineConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            nic_address: "17:00.1".to_owned(),
            gpu_address: "ca:00.0".to_owned(),
            source_ip: String::new(),
            transport: "tcp".to_owned(),
            semaphore_capacity: MAX_SEMAPHORES,
            rxq_descriptors: DEFAULT_RXQ_DESCRIPTORS,
            engine: EngineConfig::default(),
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<TrafficFilter> {
        let filter = TrafficFilter::parse(&self.source_ip, &self.transport)?;
        if self.semaphore_capacity == 0 || self.semaphore_capacity > MAX_SEMAPHORES {
            return Err(Error::InvalidConfig {
                field: "semaphore_capacity",
                reason: format!("must be in 1..={MAX_SEMAPHORES}"),
            });
        }
        if self.rxq_descriptors == 0 {
            return Err(Error::InvalidConfig {
                field: "rxq_descriptors",
                reason: "must be at least 1".to_owned(),
            });
        }
        self.engine.validate()?;
        Ok(filter)
    }
}

/// Opens the devices, steers the filtered traffic into a fresh receive queue
/// and starts the engine on it.
///
/// Nothing is opened when the configuration is invalid. When a later step
/// fails, everything opened before it is released again.
pub fn launch<C: Columnar>(platform: &Platform, config: &SourceConfig, columnar: C) -> Result<EngineHandle<C::Batch>> {
    let filter = config.validate()?;

    let context = Context::create(platform, &config.nic_address, &config.gpu_address)?;
    let rxq = ReceiveQueue::create(&context, config.rxq_descriptors)?;
    let semaphores = SemaphoreRing::create(&context, config.semaphore_capacity)?;
    let flow = FlowPipe::create(&context, &rxq, filter)?;
    info!(
        nic = %context.nic_pci(),
        gpu = %context.gpu_pci(),
        %filter,
        queue = rxq.flow_queue_id(),
        "capture pipeline ready"
    );

    CaptureEngine::new(config.engine, rxq, semaphores, Some(flow), columnar)?.spawn()
}
