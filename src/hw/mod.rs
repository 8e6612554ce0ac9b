//! Hardware objects a capture pipeline is built from.
//!
//! Construction order is [`Context`], [`ReceiveQueue`], [`SemaphoreRing`],
//! [`FlowPipe`]; each holds the context alive, so teardown runs in reverse.

mod context;
mod filter;
mod flow_pipe;
mod rxq;
mod semaphore;

pub use context::{Context, FlowPort};
pub use filter::TrafficFilter;
pub use flow_pipe::{FlowPipe, FlowPipeStats, PRIORITY_HIGH, PRIORITY_LOW};
pub use rxq::{ReceiveQueue, RxqDeviceView, RxqHostView};
pub use semaphore::{
    MAX_SEMAPHORES, SemaphoreCursor, SemaphoreDeviceView, SemaphoreHostView, SemaphoreRing,
    SlotState,
};

#[cfg(test)]
pub(crate) mod testing {
    use triomphe::Arc;

    use super::Context;
    use crate::sim::{GpuSpec, Nic, NicSpec, Platform};

    pub(crate) const NIC: &str = "17:00.1";
    pub(crate) const GPU: &str = "ca:00.0";

    pub(crate) fn platform() -> (Platform, Nic) {
        platform_with(NicSpec::default(), 1 << 30)
    }

    pub(crate) fn platform_with(nic: NicSpec, vram_bytes: usize) -> (Platform, Nic) {
        let platform = Platform::new();
        let wire = platform.add_nic(NIC, nic).unwrap();
        platform.add_gpu(GPU, GpuSpec { vram_bytes }).unwrap();
        (platform, wire)
    }

    pub(crate) fn context() -> (Platform, Nic, Arc<Context>) {
        let (platform, wire) = platform();
        let ctx = Context::create(&platform, NIC, GPU).unwrap();
        (platform, wire, ctx)
    }
}
