//! Replays a capture file onto a NIC's wire.

use std::path::Path;

use pcap::Capture;
use tracing::info;

use crate::errors::{Error, Result};
use crate::gpu::ExitHandle;
use crate::sim::{Delivery, Nic};

#[derive(Clone, Debug, Default)]
pub struct ReplayOptions {
    /// Stamp frames with the capture time instead of the replay time.
    pub keep_timestamps: bool,
    /// Stop after this many frames.
    pub limit: Option<u64>,
    /// Checked between frames.
    pub exit: Option<ExitHandle>,
}

/// What happened to the replayed frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub frames: u64,
    pub queued: u64,
    pub dropped: u64,
    pub missed: u64,
}

fn replay_error(path: &Path, err: impl ToString) -> Error {
    Error::Replay {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

fn timeval_ns(ts: &libc::timeval) -> u64 {
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_usec as u64 * 1_000)
}

/// Puts every frame of the file on `nic`'s wire in order.
pub fn replay(path: impl AsRef<Path>, nic: &Nic, options: &ReplayOptions) -> Result<ReplayStats> {
    let path = path.as_ref();
    let mut capture = Capture::from_file(path).map_err(|e| replay_error(path, e))?;
    let mut stats = ReplayStats::default();

    loop {
        if options.limit.is_some_and(|limit| stats.frames >= limit)
            || options.exit.as_ref().is_some_and(ExitHandle::is_requested)
        {
            break;
        }
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(replay_error(path, e)),
        };
        let delivery = if options.keep_timestamps {
            nic.inject_at(packet.data, timeval_ns(&packet.header.ts))
        } else {
            nic.inject(packet.data)
        };
        stats.frames += 1;
        match delivery {
            Delivery::Queued(_) => stats.queued += 1,
            Delivery::Dropped => stats.dropped += 1,
            Delivery::Missed(_) => stats.missed += 1,
        }
    }

    info!(path = %path.display(), frames = stats.frames, queued = stats.queued, "replayed capture");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pcap::{Linktype, Packet, PacketHeader};

    use super::*;
    use crate::hw::testing::context;
    use crate::hw::{FlowPipe, ReceiveQueue, TrafficFilter};
    use crate::sim::traffic::FrameSpec;

    fn write_capture(path: &Path, frames: &[Vec<u8>]) {
        let dead = Capture::dead(Linktype::ETHERNET).unwrap();
        let mut out = dead.savefile(path).unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let header = PacketHeader {
                ts: libc::timeval {
                    tv_sec: 100 + i as libc::time_t,
                    tv_usec: 5,
                },
                caplen: frame.len() as u32,
                len: frame.len() as u32,
            };
            out.write(&Packet::new(&header, frame));
        }
        out.flush().unwrap();
    }

    #[test]
    fn replays_in_order_through_the_flow_table() {
        let (_platform, wire, ctx) = context();
        let rxq = ReceiveQueue::create(&ctx, 64).unwrap();
        let _pipe = FlowPipe::create(&ctx, &rxq, TrafficFilter::default()).unwrap();

        let tcp = FrameSpec::tcp(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .build()
            .unwrap();
        let udp = FrameSpec::udp(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .build()
            .unwrap();
        let path = std::env::temp_dir().join(format!("gpunet-replay-{}.pcap", std::process::id()));
        write_capture(&path, &[tcp.clone(), udp, tcp]);

        let options = ReplayOptions {
            keep_timestamps: true,
            ..ReplayOptions::default()
        };
        let stats = replay(&path, &wire, &options).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            stats,
            ReplayStats {
                frames: 3,
                queued: 2,
                dropped: 1,
                missed: 0
            }
        );
        let frames = rxq.device_view();
        let first = frames.frames().try_recv().unwrap();
        assert_eq!(first.timestamp_ns, 100_000_005_000);
    }

    #[test]
    fn missing_file_is_a_replay_error() {
        let (_platform, wire, _ctx) = context();
        let err = replay("/nonexistent/capture.pcap", &wire, &ReplayOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Replay { .. }));
    }
}
