//! Software device layer.
//!
//! Stands in for the vendor GPU/NIC SDK: a registry of bus-addressed devices,
//! a NIC ingress path with a hardware flow table and receive queues, and a
//! frame builder for generating traffic onto the wire.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod flow;
mod nic;
mod platform;
pub mod traffic;

pub use nic::{Delivery, Nic, NicCounters, NicSpec, RawFrame};
pub(crate) use nic::HwRxq;
pub use platform::{Claim, GpuSpec, PciAddress, Platform};

/// Wall-clock nanoseconds, as stamped by the NIC on ingress.
pub fn wire_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}
