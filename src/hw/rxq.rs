use std::fmt;

use flume::Receiver;
use tracing::info;
use triomphe::Arc;

use super::Context;
use crate::errors::{Error, Result, Status, StatusExt};
use crate::gpu::MemoryLease;
use crate::kernels::MAX_PKT_SIZE;
use crate::sim::{HwRxq, RawFrame};

/// Configuration-side view of a receive queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxqHostView {
    pub flow_queue_id: u16,
    pub descriptors: u32,
    pub nic_port: u16,
}

/// Kernel-side view of a receive queue. Opaque to host code.
#[derive(Clone)]
pub struct RxqDeviceView {
    queue: u16,
    rx: Receiver<RawFrame>,
}

impl RxqDeviceView {
    pub(crate) fn frames(&self) -> &Receiver<RawFrame> {
        &self.rx
    }
}

impl fmt::Debug for RxqDeviceView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RxqDeviceView(queue {})", self.queue)
    }
}

/// Hardware receive queue delivering packets straight into GPU memory.
pub struct ReceiveQueue {
    hw: HwRxq,
    _landing: MemoryLease,
    host: RxqHostView,
    context: Arc<Context>,
}

impl ReceiveQueue {
    pub fn create(context: &Arc<Context>, descriptors: u32) -> Result<Self> {
        if descriptors == 0 {
            return Err(Error::InvalidConfig {
                field: "rxq_descriptors",
                reason: "must be at least 1".to_owned(),
            });
        }
        let hw = context.nic().rxq_create(descriptors).or_queue_alloc()?;
        let landing = context
            .gpu()
            .reserve(descriptors as usize * MAX_PKT_SIZE)
            .map_err(|_| Status::NoMemory)
            .or_queue_alloc()?;

        let host = RxqHostView {
            flow_queue_id: hw.id(),
            descriptors,
            nic_port: context.nic_port(),
        };
        info!(queue = host.flow_queue_id, descriptors, "receive queue created");
        Ok(Self {
            hw,
            _landing: landing,
            host,
            context: context.clone(),
        })
    }

    /// RSS target used by flow steering.
    pub fn flow_queue_id(&self) -> u16 {
        self.host.flow_queue_id
    }

    pub fn host_view(&self) -> RxqHostView {
        self.host
    }

    pub fn device_view(&self) -> RxqDeviceView {
        RxqDeviceView {
            queue: self.hw.id(),
            rx: self.hw.receiver(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

impl Drop for ReceiveQueue {
    fn drop(&mut self) {
        info!(queue = self.host.flow_queue_id, "receive queue destroyed");
    }
}
