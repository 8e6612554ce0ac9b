use std::time::Duration;

use flume::Sender;
use tracing::{debug, trace};
use triomphe::Arc;

use super::batch::table_from_fields;
use super::handoff::HandoffSender;
use super::{EngineConfig, EngineState, EngineStats, StateCell};
use crate::api::Columnar;
use crate::errors::Result;
use crate::gpu::{DeviceFlag, DeviceScalar, Stream};
use crate::hw::{ReceiveQueue, RxqDeviceView, SemaphoreCursor, SemaphoreDeviceView, SemaphoreRing};
use crate::kernels::{self, GatherOutputs, ReceiveArgs, ReceiveScratch, packet_gather_kernel, packet_receive_kernel};
use crate::packet::PacketDataBuffer;

/// Packets and payload bytes drained by one receive cycle.
#[derive(Clone, Copy, Debug)]
struct Drained {
    packets: usize,
    payload_bytes: usize,
}

/// Everything the poll thread owns for the lifetime of the loop.
pub(crate) struct CaptureLoop {
    stream: Stream,
    rxq: RxqDeviceView,
    semaphores: SemaphoreDeviceView,
    cursor: SemaphoreCursor,
    packet_count: DeviceScalar<u32>,
    payload_total: DeviceScalar<u32>,
    scratch: ReceiveScratch,
    exit: DeviceFlag,
    timeout: Duration,
    state: Arc<StateCell>,
    stats: Arc<EngineStats>,
}

impl CaptureLoop {
    pub(crate) fn new(
        stream: Stream,
        rxq: &ReceiveQueue,
        semaphores: &SemaphoreRing,
        exit: DeviceFlag,
        config: &EngineConfig,
        state: Arc<StateCell>,
        stats: Arc<EngineStats>,
    ) -> Result<Self> {
        Ok(Self {
            cursor: SemaphoreCursor::new(&stream, semaphores.capacity())?,
            packet_count: DeviceScalar::new(&stream, 0)?,
            payload_total: DeviceScalar::new(&stream, 0)?,
            scratch: ReceiveScratch::new(&stream, config.max_packets_per_cycle, config.max_packet_size)?,
            rxq: rxq.device_view(),
            semaphores: semaphores.device_view(),
            exit,
            timeout: config.rx_timeout,
            state,
            stats,
            stream,
        })
    }

    /// One receive cycle. `None` when nothing arrived before the timeout.
    fn poll(&mut self) -> Result<Option<Drained>> {
        self.state.set(EngineState::Polling);
        packet_receive_kernel(
            &self.stream,
            ReceiveArgs {
                rxq: &self.rxq,
                semaphores: &self.semaphores,
                semaphore_index: self.cursor.device(),
                packet_count: &mut self.packet_count,
                payload_total: &mut self.payload_total,
                scratch: &mut self.scratch,
                exit: &self.exit,
                timeout: self.timeout,
            },
        )?;

        self.state.set(EngineState::Draining);
        self.stream.synchronize()?;
        let drained = Drained {
            packets: self.packet_count.value() as usize,
            payload_bytes: self.payload_total.value() as usize,
        };
        self.stats.cycle(drained.packets, drained.payload_bytes);
        if drained.packets == 0 {
            return Ok(None);
        }
        debug!(
            packets = drained.packets,
            payload_bytes = drained.payload_bytes,
            slot = self.cursor.get(),
            "cycle drained"
        );
        Ok(Some(drained))
    }

    fn gather_packet_data(&mut self, drained: Drained) -> Result<PacketDataBuffer> {
        self.state.set(EngineState::Gathering);
        let mut buffer = PacketDataBuffer::allocate(&self.stream, drained.packets, drained.payload_bytes)?;
        kernels::gather_packet_data(
            &self.stream,
            &self.semaphores,
            self.cursor.device(),
            &self.scratch,
            &mut buffer,
        )?;
        self.cursor.advance();
        self.stream.synchronize()?;
        Ok(buffer)
    }

    fn gather_fields(&mut self, drained: Drained) -> Result<GatherOutputs> {
        self.state.set(EngineState::Gathering);
        let mut outputs = GatherOutputs::allocate(&self.stream, drained.packets, drained.payload_bytes)?;
        packet_gather_kernel(
            &self.stream,
            &self.semaphores,
            self.cursor.device(),
            &self.scratch,
            &mut outputs,
        )?;
        self.cursor.advance();
        Ok(outputs)
    }

    /// Hands one packed buffer per non-empty cycle to the accumulator.
    /// Dropping `handoff` on return closes the channel.
    pub(crate) fn run_windowed(mut self, handoff: HandoffSender<PacketDataBuffer>) -> Result<()> {
        while !self.exit.is_set() && !handoff.is_closed() {
            let Some(drained) = self.poll()? else {
                continue;
            };
            let buffer = self.gather_packet_data(drained)?;
            self.state.set(EngineState::Emitting);
            if handoff.push(buffer).is_err() {
                trace!("accumulator gone");
                break;
            }
        }
        self.shutdown()
    }

    /// Builds and sends a table every non-empty cycle.
    pub(crate) fn run_per_cycle<C: Columnar>(mut self, columnar: &C, out: &Sender<Result<C::Batch>>) -> Result<()> {
        while !self.exit.is_set() && !out.is_disconnected() {
            let Some(drained) = self.poll()? else {
                continue;
            };
            let outputs = self.gather_fields(drained)?;
            self.state.set(EngineState::Emitting);
            let table = table_from_fields(
                columnar,
                &self.stream,
                outputs.fields,
                outputs.data_offsets,
                outputs.data,
            )?;
            self.stats.batch(drained.packets);
            debug!(rows = drained.packets, "batch emitted");
            if out.send(Ok(table)).is_err() {
                trace!("consumer gone");
                break;
            }
        }
        self.shutdown()
    }

    fn shutdown(self) -> Result<()> {
        self.stream.synchronize()?;
        debug!(cursor = self.cursor.get(), "poll loop finished");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> u32 {
        self.cursor.get()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::gpu::ExitCondition;
    use crate::hw::testing::context;
    use crate::hw::{FlowPipe, SlotState, TrafficFilter};
    use crate::sim::traffic::FrameSpec;

    #[test]
    fn drains_gather_and_advance_cursor() {
        let (_platform, wire, ctx) = context();
        let rxq = ReceiveQueue::create(&ctx, 256).unwrap();
        let semaphores = SemaphoreRing::create(&ctx, 2).unwrap();
        let _pipe = FlowPipe::create(&ctx, &rxq, TrafficFilter::default()).unwrap();
        let exit = ExitCondition::new(ctx.gpu()).unwrap();
        let config = EngineConfig {
            rx_timeout: Duration::from_millis(5),
            max_packets_per_cycle: 8,
            max_packet_size: 256,
            ..EngineConfig::default()
        };
        let mut capture = CaptureLoop::new(
            ctx.gpu().create_stream(),
            &rxq,
            &semaphores,
            exit.device(),
            &config,
            Arc::new(StateCell::new()),
            Arc::new(EngineStats::default()),
        )
        .unwrap();

        assert!(capture.poll().unwrap().is_none());
        assert_eq!(capture.cursor(), 0);

        let frame = FrameSpec::tcp(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .payload(vec![1; 10])
            .build()
            .unwrap();
        for expected_cursor in [1, 0, 1] {
            for _ in 0..3 {
                wire.inject(&frame);
            }
            let drained = capture.poll().unwrap().unwrap();
            assert_eq!((drained.packets, drained.payload_bytes), (3, 30));
            let buffer = capture.gather_packet_data(drained).unwrap();
            assert!(buffer.is_consistent());
            assert_eq!(buffer.num_packets(), 3);
            assert_eq!(capture.cursor(), expected_cursor);
        }
        assert_eq!(semaphores.host_view().state(0), Some(SlotState::Free));
        assert_eq!(semaphores.host_view().state(1), Some(SlotState::Free));
    }

    #[test]
    fn frames_longer_than_the_bound_keep_their_headers() {
        let (_platform, wire, ctx) = context();
        let rxq = ReceiveQueue::create(&ctx, 256).unwrap();
        let semaphores = SemaphoreRing::create(&ctx, 2).unwrap();
        let filter = TrafficFilter::parse("10.0.0.5", "tcp").unwrap();
        let _pipe = FlowPipe::create(&ctx, &rxq, filter).unwrap();
        let exit = ExitCondition::new(ctx.gpu()).unwrap();
        let config = EngineConfig {
            rx_timeout: Duration::from_millis(5),
            max_packets_per_cycle: 8,
            max_packet_size: 256,
            ..EngineConfig::default()
        };
        let mut capture = CaptureLoop::new(
            ctx.gpu().create_stream(),
            &rxq,
            &semaphores,
            exit.device(),
            &config,
            Arc::new(StateCell::new()),
            Arc::new(EngineStats::default()),
        )
        .unwrap();

        let frame = FrameSpec::tcp(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .macs([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], [1, 2, 3, 4, 5, 6])
            .payload(vec![7; 500])
            .build()
            .unwrap();
        wire.inject(&frame);

        let drained = capture.poll().unwrap().unwrap();
        // 14 byte Ethernet, 20 byte IPv4 and 20 byte TCP headers fit in the bound.
        assert_eq!((drained.packets, drained.payload_bytes), (1, 256 - 54));
        let buffer = capture.gather_packet_data(drained).unwrap();
        assert!(buffer.is_consistent());
        let rec = buffer.record(0).unwrap();
        assert_eq!(rec.src_ip, u32::from(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(rec.dst_ip, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(rec.src_mac, 0xaabb_ccdd_eeff);
        assert_eq!(rec.dst_mac, 0x0102_0304_0506);
        assert_eq!(rec.ether_type, 0x0800);
        assert_eq!(rec.next_proto_id, 6);
        assert_eq!(buffer.payload_sizes().to_host(), vec![202]);
    }
}
