//! Synthetic traffic for the simulated wire.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use etherparse::PacketBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::flow::L4Type;
use crate::errors::{Error, Result};

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;
pub const TCP_ECE: u8 = 0x40;
pub const TCP_CWR: u8 = 0x80;

/// Description of one Ethernet/IPv4/TCP-or-UDP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSpec {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: L4Type,
    pub tcp_flags: u8,
    pub payload: Vec<u8>,
}

impl FrameSpec {
    pub fn tcp(src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Self {
        Self {
            src_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            dst_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x02],
            src_ip,
            dst_ip,
            src_port: 40000,
            dst_port: 5201,
            transport: L4Type::Tcp,
            tcp_flags: TCP_PSH | TCP_ACK,
            payload: Vec::new(),
        }
    }

    pub fn udp(src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Self {
        Self {
            transport: L4Type::Udp,
            tcp_flags: 0,
            ..Self::tcp(src_ip, dst_ip)
        }
    }

    pub fn ports(mut self, src: u16, dst: u16) -> Self {
        self.src_port = src;
        self.dst_port = dst;
        self
    }

    pub fn macs(mut self, src: [u8; 6], dst: [u8; 6]) -> Self {
        self.src_mac = src;
        self.dst_mac = dst;
        self
    }

    pub fn flags(mut self, tcp_flags: u8) -> Self {
        self.tcp_flags = tcp_flags;
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serializes the frame.
    pub fn build(&self) -> Result<Vec<u8>> {
        let ip = PacketBuilder::ethernet2(self.src_mac, self.dst_mac).ipv4(
            self.src_ip.octets(),
            self.dst_ip.octets(),
            64,
        );
        let mut out = Vec::new();
        let written = match self.transport {
            L4Type::Tcp => {
                let f = self.tcp_flags;
                let mut tcp = ip.tcp(self.src_port, self.dst_port, 1, 65535);
                if f & TCP_FIN != 0 {
                    tcp = tcp.fin();
                }
                if f & TCP_SYN != 0 {
                    tcp = tcp.syn();
                }
                if f & TCP_RST != 0 {
                    tcp = tcp.rst();
                }
                if f & TCP_PSH != 0 {
                    tcp = tcp.psh();
                }
                if f & TCP_ACK != 0 {
                    tcp = tcp.ack(1);
                }
                if f & TCP_URG != 0 {
                    tcp = tcp.urg(0);
                }
                if f & TCP_ECE != 0 {
                    tcp = tcp.ece();
                }
                if f & TCP_CWR != 0 {
                    tcp = tcp.cwr();
                }
                out.reserve(tcp.size(self.payload.len()));
                tcp.write(&mut out, &self.payload)
            }
            L4Type::Udp => {
                let udp = ip.udp(self.src_port, self.dst_port);
                out.reserve(udp.size(self.payload.len()));
                udp.write(&mut out, &self.payload)
            }
        };
        written.map_err(|e| Error::InvalidConfig {
            field: "frame",
            reason: format!("{e:?}"),
        })?;
        Ok(out)
    }
}

/// Endless stream of frames around a template, with random payload sizes.
///
/// Each payload starts with the big-endian frame sequence number.
pub struct TrafficGenerator {
    rng: StdRng,
    template: FrameSpec,
    payload_len: RangeInclusive<usize>,
    seq: u64,
}

impl TrafficGenerator {
    pub fn new(template: FrameSpec, payload_len: RangeInclusive<usize>, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            template,
            payload_len,
            seq: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn next_frame(&mut self) -> Result<Vec<u8>> {
        let len = self
            .rng
            .random_range(self.payload_len.clone())
            .max(size_of::<u64>());
        let mut payload = vec![0u8; len];
        payload[..8].copy_from_slice(&self.seq.to_be_bytes());
        self.rng.fill(&mut payload[8..]);
        self.seq += 1;

        let mut spec = self.template.clone();
        spec.payload = payload;
        spec.build()
    }
}
