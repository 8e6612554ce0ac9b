use std::net::Ipv4Addr;
use std::thread;
use std::time::Instant;

use super::*;
use crate::columnar::{DeviceTables, Table};
use crate::gpu::Fault;
use crate::hw::testing::{GPU, NIC, context};
use crate::hw::TrafficFilter;
use crate::sim::traffic::{FrameSpec, TrafficGenerator};
use crate::sim::{Nic, PciAddress, Platform};

struct Running {
    platform: Platform,
    wire: Nic,
    handle: EngineHandle<Table>,
}

fn start(config: EngineConfig) -> Running {
    let (platform, wire, ctx) = context();
    let rxq = ReceiveQueue::create(&ctx, 4096).unwrap();
    let semaphores = SemaphoreRing::create(&ctx, 16).unwrap();
    let pipe = FlowPipe::create(&ctx, &rxq, TrafficFilter::default()).unwrap();
    drop(ctx);
    let handle = CaptureEngine::new(config, rxq, semaphores, Some(pipe), DeviceTables)
        .unwrap()
        .spawn()
        .unwrap();
    Running {
        platform,
        wire,
        handle,
    }
}

fn quick(mode: EmitMode) -> EngineConfig {
    EngineConfig {
        mode,
        max_packets_per_cycle: 16,
        ..EngineConfig::default()
    }
}

fn windowed(ms: u64) -> EmitMode {
    EmitMode::Windowed {
        window: Duration::from_millis(ms),
    }
}

fn generator() -> TrafficGenerator {
    let template = FrameSpec::tcp(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1)).ports(40000, 5201);
    TrafficGenerator::new(template, 8..=200, 7)
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn sequence_numbers(tables: &[Table]) -> Vec<u64> {
    tables
        .iter()
        .flat_map(|t| {
            let data = t.column("data").unwrap();
            (0..t.num_rows()).map(move |row| {
                let bytes = data.bytes(row).unwrap();
                u64::from_be_bytes(bytes[..8].try_into().unwrap())
            })
        })
        .collect()
}

fn nic_address() -> PciAddress {
    NIC.parse().unwrap()
}

#[test]
fn rejects_invalid_config() {
    let (_platform, _wire, ctx) = context();
    let rxq = ReceiveQueue::create(&ctx, 64).unwrap();
    let semaphores = SemaphoreRing::create(&ctx, 4).unwrap();
    let config = EngineConfig {
        mode: windowed(0),
        ..EngineConfig::default()
    };
    assert!(matches!(
        CaptureEngine::new(config, rxq, semaphores, None, DeviceTables),
        Err(Error::InvalidConfig { field: "window", .. })
    ));
    assert!(EngineConfig::default().validate().is_ok());
    assert_eq!(EngineConfig::default().mode, windowed(100));
}

#[test]
fn idle_polls_allocate_and_emit_nothing() {
    for mode in [windowed(10), EmitMode::PerCycle] {
        let run = start(quick(mode));
        let gpu = run.handle.gpu().clone();
        wait_for("first idle cycles", || run.handle.stats().idle_polls >= 3);
        let allocations = gpu.allocations_made();
        let cycles = run.handle.stats().cycles;

        wait_for("more idle cycles", || run.handle.stats().cycles >= cycles + 10);
        assert_eq!(gpu.allocations_made(), allocations);
        assert!(run.handle.batches().is_empty());
        let stats = run.handle.stats();
        assert_eq!((stats.packets, stats.batches), (0, 0));
        assert!(run.handle.stop().unwrap().is_empty());
    }
}

#[test]
fn windowed_and_per_cycle_carry_the_same_packets() {
    let mut seen = Vec::new();
    for mode in [windowed(50), EmitMode::PerCycle] {
        let run = start(quick(mode));
        let mut traffic = generator();
        for _ in 0..100 {
            run.wire.inject(&traffic.next_frame().unwrap());
        }
        wait_for("all packets", || run.handle.stats().packets == 100);
        let tables = run.handle.stop().unwrap();
        assert_eq!(tables.iter().map(Table::num_rows).sum::<usize>(), 100);
        for t in &tables {
            assert_eq!(t.column_names(), &crate::api::BATCH_COLUMNS);
            assert_eq!(
                t.column("src_ip").unwrap().strings_to_host().unwrap()[0],
                "10.0.0.5"
            );
        }
        seen.push(sequence_numbers(&tables));
    }
    assert_eq!(seen[0], (0..100).collect::<Vec<_>>());
    assert_eq!(seen[0], seen[1]);
}

#[test]
fn bursts_split_by_an_idle_cycle_share_one_window() {
    let run = start(EngineConfig {
        mode: windowed(2000),
        ..EngineConfig::default()
    });
    let src = Ipv4Addr::new(10, 0, 0, 5);
    let dst = Ipv4Addr::new(10, 0, 0, 1);
    let small = FrameSpec::tcp(src, dst).payload(vec![1; 4]).build().unwrap();
    let large = FrameSpec::tcp(src, dst).payload(vec![2; 6]).build().unwrap();

    for _ in 0..100 {
        run.wire.inject(&small);
    }
    wait_for("first burst", || run.handle.stats().packets == 100);
    let idle = run.handle.stats().idle_polls;
    wait_for("an empty cycle", || run.handle.stats().idle_polls > idle);
    for _ in 0..50 {
        run.wire.inject(&large);
    }
    wait_for("second burst", || run.handle.stats().packets == 150);

    let table = run.handle.batches().recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(table.num_rows(), 150);
    let sizes = table.column("packet_size").unwrap().values::<u32>().unwrap();
    assert_eq!(sizes.iter().sum::<u32>(), 100 * 4 + 50 * 6);
    let stats = run.handle.stats();
    assert_eq!((stats.batches, stats.batch_rows, stats.payload_bytes), (1, 150, 700));
    assert!(run.handle.stop().unwrap().is_empty());
}

#[test]
fn per_cycle_emits_at_most_one_cycle_per_batch() {
    let run = start(quick(EmitMode::PerCycle));
    let mut traffic = generator();
    for _ in 0..40 {
        run.wire.inject(&traffic.next_frame().unwrap());
    }
    wait_for("all packets", || run.handle.stats().packets == 40);
    let tables = run.handle.stop().unwrap();
    assert!(tables.len() >= 3);
    assert!(tables.iter().all(|t| (1..=16).contains(&t.num_rows())));
}

#[test]
fn consumer_receives_batches_while_running() {
    let run = start(quick(windowed(5)));
    let mut traffic = generator();
    for _ in 0..10 {
        run.wire.inject(&traffic.next_frame().unwrap());
    }
    let table = run
        .handle
        .batches()
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .unwrap();
    assert!(table.num_rows() >= 1);
    let stats = run.handle.stats();
    assert!(stats.batches >= 1);
    assert!(stats.batch_rows >= table.num_rows() as u64);
    run.handle.stop().unwrap();
}

#[test]
fn exit_mid_poll_is_prompt_and_leaks_nothing() {
    let config = EngineConfig {
        rx_timeout: Duration::from_secs(2),
        ..quick(windowed(10))
    };
    let run = start(config);
    let gpu = run.handle.gpu().clone();
    wait_for("receive kernel", || run.handle.state() == EngineState::Polling);
    assert!(run.platform.is_open(nic_address()));

    let start = Instant::now();
    let pending = run.handle.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(pending.is_empty());
    assert_eq!(gpu.allocated_bytes(), 0);
    assert_eq!(gpu.live_allocations(), 0);
    assert!(!run.platform.is_open(nic_address()));
    assert!(!run.platform.is_open(GPU.parse().unwrap()));
}

#[test]
fn device_memory_returns_once_batches_are_dropped() {
    let run = start(quick(windowed(5)));
    let gpu = run.handle.gpu().clone();
    let mut traffic = generator();
    for _ in 0..5 {
        run.wire.inject(&traffic.next_frame().unwrap());
    }
    wait_for("all packets", || run.handle.stats().packets == 5);
    let exit = run.handle.exit_handle();
    assert!(exit.request());
    let tables = run.handle.join().unwrap();
    assert!(!tables.is_empty());
    assert!(gpu.allocated_bytes() > 0);
    drop(tables);
    assert_eq!(gpu.allocated_bytes(), 0);
    assert!(!run.platform.is_open(nic_address()));
}

#[test]
fn kernel_launch_failure_ends_engine() {
    let run = start(quick(windowed(5)));
    wait_for("first cycle", || run.handle.stats().cycles >= 1);
    run.handle
        .gpu()
        .inject_fault(Fault::KernelLaunch("packet_receive_kernel"));

    let err = run
        .handle
        .batches()
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        Error::KernelLaunch {
            kernel: "packet_receive_kernel",
            ..
        }
    ));
    assert_eq!(run.handle.state(), EngineState::Stopped);
    assert_eq!(run.handle.join().unwrap_err(), err);
    assert!(!run.platform.is_open(nic_address()));
}

#[test]
fn stream_sync_failure_ends_engine() {
    let run = start(quick(EmitMode::PerCycle));
    wait_for("first cycle", || run.handle.stats().cycles >= 1);
    run.handle.gpu().inject_fault(Fault::StreamSync);
    let err = run.handle.join().unwrap_err();
    assert!(matches!(err, Error::StreamSync { .. }));
}

#[test]
fn allocation_failure_ends_engine() {
    for mode in [windowed(5), EmitMode::PerCycle] {
        let run = start(quick(mode));
        wait_for("first cycle", || run.handle.stats().cycles >= 1);
        run.handle.gpu().inject_fault(Fault::Allocation);
        run.wire.inject(&generator().next_frame().unwrap());
        let err = run.handle.join().unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }), "{err}");
    }
}
