//! GPU-direct packet capture.
//!
//! Packets steered by the NIC's flow table land in a receive queue that the
//! GPU drains directly; the capture engine turns them into columnar tables
//! of parsed headers and payloads without a host-side copy of the packet
//! data.

pub mod api;
pub mod columnar;
pub mod engine;
pub mod errors;
pub mod gpu;
pub mod hw;
pub mod kernels;
pub mod packet;
#[cfg(feature = "pcap")]
pub mod pcap;
pub mod sim;
pub mod source;

pub use errors::{Error, Result, Status};
