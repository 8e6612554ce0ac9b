//! Device kernels of the capture pipeline.
//!
//! Every kernel is launched on a [`Stream`](crate::gpu::Stream) and may fail
//! at launch; results become visible to the host after the stream is
//! synchronized.

mod convert;
mod gather;
mod receive;

use std::time::Duration;

pub use convert::{sizes_to_offsets, unpack_headers};
pub use gather::{GatherOutputs, gather_packet_data, packet_gather_kernel};
pub use receive::{ReceiveArgs, packet_receive_kernel};

use crate::errors::Result;
use crate::gpu::{DeviceBuffer, Stream};
use crate::packet::HeaderRecord;

/// Packets drained by one receive cycle at most.
pub const MAX_PKT_RECEIVE: usize = 4096;
/// Bytes of one packet landing slot.
pub const MAX_PKT_SIZE: usize = 4096;
/// How long a receive cycle waits for traffic.
pub const PACKET_RX_TIMEOUT: Duration = Duration::from_millis(1);

/// Bounded per-cycle landing area the receive kernel fills and the gather
/// kernels read. Allocated once per poll loop.
pub struct ReceiveScratch {
    bytes: DeviceBuffer<u8>,
    sizes: DeviceBuffer<u32>,
    timestamps: DeviceBuffer<u64>,
    max_packets: usize,
    max_packet_size: usize,
}

impl ReceiveScratch {
    pub fn new(stream: &Stream, max_packets: usize, max_packet_size: usize) -> Result<Self> {
        Ok(Self {
            bytes: DeviceBuffer::zeroed(stream, max_packets * max_packet_size)?,
            sizes: DeviceBuffer::zeroed(stream, max_packets)?,
            timestamps: DeviceBuffer::zeroed(stream, max_packets)?,
            max_packets,
            max_packet_size,
        })
    }

    pub fn max_packets(&self) -> usize {
        self.max_packets
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Header record and payload of landed packet `idx`.
    fn packet(&self, idx: usize) -> (HeaderRecord, &[u8]) {
        let len = self.sizes.device()[idx] as usize;
        let at = idx * self.max_packet_size;
        let frame = &self.bytes.device()[at..at + len];
        HeaderRecord::from_frame(frame, self.timestamps.device()[idx])
    }
}

/// One device column per header field, `count` rows each.
pub struct PacketFields {
    pub timestamp: DeviceBuffer<u64>,
    pub src_mac: DeviceBuffer<u64>,
    pub dst_mac: DeviceBuffer<u64>,
    pub src_ip: DeviceBuffer<u32>,
    pub dst_ip: DeviceBuffer<u32>,
    pub src_port: DeviceBuffer<u16>,
    pub dst_port: DeviceBuffer<u16>,
    pub packet_size: DeviceBuffer<u32>,
    pub tcp_flags: DeviceBuffer<u8>,
    pub ether_type: DeviceBuffer<u16>,
    pub next_proto_id: DeviceBuffer<u8>,
}

impl PacketFields {
    pub fn allocate(stream: &Stream, count: usize) -> Result<Self> {
        Ok(Self {
            timestamp: DeviceBuffer::zeroed(stream, count)?,
            src_mac: DeviceBuffer::zeroed(stream, count)?,
            dst_mac: DeviceBuffer::zeroed(stream, count)?,
            src_ip: DeviceBuffer::zeroed(stream, count)?,
            dst_ip: DeviceBuffer::zeroed(stream, count)?,
            src_port: DeviceBuffer::zeroed(stream, count)?,
            dst_port: DeviceBuffer::zeroed(stream, count)?,
            packet_size: DeviceBuffer::zeroed(stream, count)?,
            tcp_flags: DeviceBuffer::zeroed(stream, count)?,
            ether_type: DeviceBuffer::zeroed(stream, count)?,
            next_proto_id: DeviceBuffer::zeroed(stream, count)?,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }

    fn store(&mut self, idx: usize, rec: &HeaderRecord, payload_len: u32) {
        self.timestamp.device_mut()[idx] = rec.timestamp;
        self.src_mac.device_mut()[idx] = rec.src_mac;
        self.dst_mac.device_mut()[idx] = rec.dst_mac;
        self.src_ip.device_mut()[idx] = rec.src_ip;
        self.dst_ip.device_mut()[idx] = rec.dst_ip;
        self.src_port.device_mut()[idx] = rec.src_port;
        self.dst_port.device_mut()[idx] = rec.dst_port;
        self.packet_size.device_mut()[idx] = payload_len;
        self.tcp_flags.device_mut()[idx] = rec.tcp_flags;
        self.ether_type.device_mut()[idx] = rec.ether_type;
        self.next_proto_id.device_mut()[idx] = rec.next_proto_id;
    }
}
