use parking_lot::MutexGuard;
use tracing::{debug, info};
use triomphe::Arc;

use crate::errors::{Result, Status, StatusExt};
use crate::gpu::Gpu;
use crate::sim::flow::FlowEngine;
use crate::sim::{Claim, Nic, PciAddress, Platform};

/// Started flow-management port of a NIC. Stopping it tears down every pipe
/// still installed.
pub struct FlowPort {
    nic: Nic,
}

impl FlowPort {
    fn start(nic: &Nic) -> std::result::Result<Self, Status> {
        nic.flow().port_start()?;
        Ok(Self { nic: nic.clone() })
    }

    pub fn port_id(&self) -> u16 {
        self.nic.spec().port_id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FlowEngine> {
        self.nic.flow()
    }
}

impl Drop for FlowPort {
    fn drop(&mut self) {
        self.nic.flow().port_stop();
        debug!(port = self.port_id(), "flow port stopped");
    }
}

/// GPU/NIC pair opened for direct packet delivery.
///
/// Shared by every other hardware object and immutable once created.
pub struct Context {
    // Fields drop in declaration order: flow port, NIC, GPU.
    flow_port: FlowPort,
    nic: Nic,
    _nic_claim: Claim,
    gpu: Gpu,
    _gpu_claim: Claim,
    nic_pci: PciAddress,
    gpu_pci: PciAddress,
}

impl Context {
    pub fn create(platform: &Platform, nic_address: &str, gpu_address: &str) -> Result<Arc<Self>> {
        let gpu_pci: PciAddress = gpu_address
            .parse()
            .or_device_init(&format!("gpu address {gpu_address:?}"))?;
        let nic_pci: PciAddress = nic_address
            .parse()
            .or_device_init(&format!("nic address {nic_address:?}"))?;

        let (gpu, gpu_claim) = platform
            .open_gpu(gpu_pci)
            .or_device_init(&format!("open gpu {gpu_pci}"))?;
        let (nic, nic_claim) = platform
            .open_nic(nic_pci)
            .or_device_init(&format!("open nic {nic_pci}"))?;
        if !nic.spec().gpudirect {
            return Err::<Arc<Self>, _>(Status::NotSupported)
                .or_device_init(&format!("nic {nic_pci} cannot deliver to gpu {gpu_pci}"));
        }
        let flow_port = FlowPort::start(&nic).or_device_init("start flow port")?;

        info!(
            nic = %nic_pci,
            gpu = %gpu_pci,
            port = flow_port.port_id(),
            "hardware context ready"
        );
        Ok(Arc::new(Self {
            flow_port,
            nic,
            _nic_claim: nic_claim,
            gpu,
            _gpu_claim: gpu_claim,
            nic_pci,
            gpu_pci,
        }))
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn nic(&self) -> &Nic {
        &self.nic
    }

    pub fn nic_port(&self) -> u16 {
        self.flow_port.port_id()
    }

    pub fn flow_port(&self) -> &FlowPort {
        &self.flow_port
    }

    pub fn nic_pci(&self) -> PciAddress {
        self.nic_pci
    }

    pub fn gpu_pci(&self) -> PciAddress {
        self.gpu_pci
    }

    pub fn max_queue_count(&self) -> u16 {
        self.nic.spec().max_queues
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        info!(nic = %self.nic_pci, gpu = %self.gpu_pci, "hardware context released");
    }
}
