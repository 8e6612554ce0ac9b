//! Device-resident capture batches.

use std::fmt;

use etherparse::{LaxPacketHeaders, LinkHeader, NetHeaders, TransportHeader};

use crate::errors::{Error, Result};
use crate::gpu::{DeviceBuffer, Stream};

/// Size of one packed [`HeaderRecord`].
pub const HEADER_STRIDE: usize = 40;

/// Header fields extracted from one packet.
///
/// Packed little-endian as: timestamp u64, src_mac u64, dst_mac u64,
/// src_ip u32, dst_ip u32, src_port u16, dst_port u16, ether_type u16,
/// tcp_flags u8, next_proto_id u8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeaderRecord {
    pub timestamp: u64,
    /// 48-bit MAC in the low bits, first octet most significant.
    pub src_mac: u64,
    pub dst_mac: u64,
    /// IPv4 address, first octet most significant.
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub ether_type: u16,
    pub tcp_flags: u8,
    pub next_proto_id: u8,
}

fn mac_to_u64(mac: [u8; 6]) -> u64 {
    mac.iter().fold(0, |acc, b| (acc << 8) | *b as u64)
}

fn tcp_flags(tcp: &etherparse::TcpHeader) -> u8 {
    [tcp.fin, tcp.syn, tcp.rst, tcp.psh, tcp.ack, tcp.urg, tcp.ece, tcp.cwr]
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, set)| acc | ((*set as u8) << bit))
}

impl HeaderRecord {
    /// Extracts the header fields of an Ethernet frame and returns them with
    /// the transport payload. Layers that are absent or malformed stay zero.
    ///
    /// `frame` may be cut short of the length its IP header announces; the
    /// headers that fit are still extracted and the payload is what remains.
    pub fn from_frame(frame: &[u8], timestamp: u64) -> (Self, &[u8]) {
        let mut rec = Self {
            timestamp,
            ..Default::default()
        };
        let Ok(headers) = LaxPacketHeaders::from_ethernet(frame) else {
            return (rec, &[]);
        };
        if let Some(LinkHeader::Ethernet2(eth)) = &headers.link {
            rec.src_mac = mac_to_u64(eth.source);
            rec.dst_mac = mac_to_u64(eth.destination);
            rec.ether_type = eth.ether_type.0;
        }
        if let Some(NetHeaders::Ipv4(ip, _)) = &headers.net {
            rec.src_ip = u32::from_be_bytes(ip.source);
            rec.dst_ip = u32::from_be_bytes(ip.destination);
            rec.next_proto_id = ip.protocol.0;
        }
        match &headers.transport {
            Some(TransportHeader::Tcp(tcp)) => {
                rec.src_port = tcp.source_port;
                rec.dst_port = tcp.destination_port;
                rec.tcp_flags = tcp_flags(tcp);
            }
            Some(TransportHeader::Udp(udp)) => {
                rec.src_port = udp.source_port;
                rec.dst_port = udp.destination_port;
            }
            _ => {}
        }
        (rec, headers.payload.slice())
    }

    pub fn encode(&self, out: &mut [u8]) {
        let out = &mut out[..HEADER_STRIDE];
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.src_mac.to_le_bytes());
        out[16..24].copy_from_slice(&self.dst_mac.to_le_bytes());
        out[24..28].copy_from_slice(&self.src_ip.to_le_bytes());
        out[28..32].copy_from_slice(&self.dst_ip.to_le_bytes());
        out[32..34].copy_from_slice(&self.src_port.to_le_bytes());
        out[34..36].copy_from_slice(&self.dst_port.to_le_bytes());
        out[36..38].copy_from_slice(&self.ether_type.to_le_bytes());
        out[38] = self.tcp_flags;
        out[39] = self.next_proto_id;
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let b = &bytes[..HEADER_STRIDE];
        let u64_at = |at: usize| u64::from_le_bytes(b[at..at + 8].try_into().unwrap_or_default());
        let u32_at = |at: usize| u32::from_le_bytes(b[at..at + 4].try_into().unwrap_or_default());
        let u16_at = |at: usize| u16::from_le_bytes(b[at..at + 2].try_into().unwrap_or_default());
        Self {
            timestamp: u64_at(0),
            src_mac: u64_at(8),
            dst_mac: u64_at(16),
            src_ip: u32_at(24),
            dst_ip: u32_at(28),
            src_port: u16_at(32),
            dst_port: u16_at(34),
            ether_type: u16_at(36),
            tcp_flags: b[38],
            next_proto_id: b[39],
        }
    }
}

/// One capture batch in device memory: packed header records, concatenated
/// payloads and per-packet payload sizes.
///
/// Move-only. Device memory is returned when the buffer is dropped.
pub struct PacketDataBuffer {
    num_packets: usize,
    header: DeviceBuffer<u8>,
    payload: DeviceBuffer<u8>,
    payload_sizes: DeviceBuffer<u32>,
    stream: u32,
}

impl fmt::Debug for PacketDataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketDataBuffer")
            .field("num_packets", &self.num_packets)
            .field("payload_bytes", &self.payload.len())
            .field("stream", &self.stream)
            .finish()
    }
}

impl PacketDataBuffer {
    /// Exact-size, zeroed allocation for `num_packets` packets carrying
    /// `payload_bytes` bytes in total.
    #[track_caller]
    pub fn allocate(stream: &Stream, num_packets: usize, payload_bytes: usize) -> Result<Self> {
        Ok(Self {
            num_packets,
            header: DeviceBuffer::zeroed(stream, num_packets * HEADER_STRIDE)?,
            payload: DeviceBuffer::zeroed(stream, payload_bytes)?,
            payload_sizes: DeviceBuffer::zeroed(stream, num_packets)?,
            stream: stream.id(),
        })
    }

    /// Uploads host-side packets.
    pub fn from_packets(stream: &Stream, packets: &[(HeaderRecord, &[u8])]) -> Result<Self> {
        let total: usize = packets.iter().map(|(_, p)| p.len()).sum();
        let mut header = vec![0u8; packets.len() * HEADER_STRIDE];
        let mut payload = Vec::with_capacity(total);
        let mut sizes = Vec::with_capacity(packets.len());
        for (i, (rec, data)) in packets.iter().enumerate() {
            rec.encode(&mut header[i * HEADER_STRIDE..]);
            payload.extend_from_slice(data);
            sizes.push(data.len() as u32);
        }
        Ok(Self {
            num_packets: packets.len(),
            header: DeviceBuffer::from_host(stream, &header)?,
            payload: DeviceBuffer::from_host(stream, &payload)?,
            payload_sizes: DeviceBuffer::from_host(stream, &sizes)?,
            stream: stream.id(),
        })
    }

    pub fn num_packets(&self) -> usize {
        self.num_packets
    }

    pub fn header_bytes(&self) -> usize {
        self.header.len()
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream
    }

    pub fn header(&self) -> &DeviceBuffer<u8> {
        &self.header
    }

    pub fn payload(&self) -> &DeviceBuffer<u8> {
        &self.payload
    }

    pub fn payload_sizes(&self) -> &DeviceBuffer<u32> {
        &self.payload_sizes
    }

    /// Releases everything but the payload bytes.
    pub fn into_payload(self) -> DeviceBuffer<u8> {
        self.payload
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut DeviceBuffer<u8>, &mut DeviceBuffer<u8>, &mut DeviceBuffer<u32>) {
        (&mut self.header, &mut self.payload, &mut self.payload_sizes)
    }

    /// Header buffer holds `num_packets` records, the size buffer
    /// `num_packets` entries, and the sizes sum to the payload length.
    pub fn is_consistent(&self) -> bool {
        let sizes = self.payload_sizes.to_host();
        self.header.len() == self.num_packets * HEADER_STRIDE
            && sizes.len() == self.num_packets
            && sizes.iter().map(|s| *s as usize).sum::<usize>() == self.payload.len()
    }

    /// Host copy of the header record of packet `idx`.
    pub fn record(&self, idx: usize) -> Option<HeaderRecord> {
        (idx < self.num_packets).then(|| {
            let at = idx * HEADER_STRIDE;
            HeaderRecord::decode(&self.header.device()[at..at + HEADER_STRIDE])
        })
    }

    /// Concatenates buffers in order into one, releasing the sources.
    ///
    /// A single buffer is passed through untouched. Otherwise every field is
    /// copied device to device at its cumulative offset and the stream is
    /// synchronized before the sources are dropped.
    pub fn concat(stream: &Stream, mut buffers: Vec<PacketDataBuffer>) -> Result<Self> {
        match buffers.len() {
            0 => {
                return Err(Error::InvalidConfig {
                    field: "concat",
                    reason: "no buffers to concatenate".to_owned(),
                });
            }
            1 => return Ok(buffers.remove(0)),
            _ => {}
        }

        let num_packets = buffers.iter().map(|b| b.num_packets).sum();
        let payload_bytes = buffers.iter().map(|b| b.payload.len()).sum();
        let mut out = Self::allocate(stream, num_packets, payload_bytes)?;

        let (mut header_at, mut payload_at, mut sizes_at) = (0, 0, 0);
        for buf in &buffers {
            out.header.copy_from(header_at, &buf.header)?;
            out.payload.copy_from(payload_at, &buf.payload)?;
            out.payload_sizes.copy_from(sizes_at, &buf.payload_sizes)?;
            header_at += buf.header.len();
            payload_at += buf.payload.len();
            sizes_at += buf.payload_sizes.len();
        }
        stream.synchronize()?;
        Ok(out)
    }
}
