use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gpunet_rs::columnar::Table;
use gpunet_rs::engine::{EmitMode, EngineConfig};
use gpunet_rs::kernels::{MAX_PKT_RECEIVE, MAX_PKT_SIZE};
use gpunet_rs::sim::traffic::{FrameSpec, TrafficGenerator};
use gpunet_rs::sim::{GpuSpec, NicSpec, PciAddress, Platform};
use gpunet_rs::source::{self, SourceConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// NIC PCI address.
    #[clap(short, long, default_value = "17:00.1")]
    nic: String,

    /// GPU PCI address.
    #[clap(short, long, default_value = "ca:00.0")]
    gpu: String,

    /// Only capture traffic from this source address.
    #[clap(short, long, default_value = "")]
    source_ip: String,

    /// Transport protocol to capture.
    #[clap(short, long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// How batches are emitted.
    #[clap(short, long, value_enum, default_value_t = Mode::Windowed)]
    mode: Mode,

    /// Accumulation window in milliseconds (windowed mode).
    #[clap(short, long, default_value_t = 100)]
    window_ms: u64,

    /// Receive timeout per cycle in microseconds.
    #[clap(long, default_value_t = 1000)]
    rx_timeout_us: u64,

    #[clap(long, default_value_t = MAX_PKT_RECEIVE)]
    max_packets: usize,

    #[clap(long, default_value_t = MAX_PKT_SIZE)]
    max_packet_size: usize,

    #[clap(long, default_value_t = 1024)]
    semaphores: u16,

    #[clap(long, default_value_t = source::DEFAULT_RXQ_DESCRIPTORS)]
    descriptors: u32,

    /// Print the first rows of every batch.
    #[clap(short, long)]
    debug: bool,

    /// Where traffic comes from.
    #[clap(subcommand)]
    traffic: Traffic,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Transport {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Windowed,
    PerCycle,
}

#[derive(Subcommand, Debug)]
enum Traffic {
    /// Synthetic frames at a fixed rate.
    Generate(GenerateArgs),
    /// Frames from a capture file.
    #[cfg(feature = "pcap")]
    Replay(ReplayArgs),
}

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Frames per second; 0 for as fast as possible.
    #[clap(long, default_value_t = 100_000)]
    rate: u64,

    #[clap(long, default_value = "10.0.0.5")]
    src: Ipv4Addr,

    #[clap(long, default_value = "10.0.0.1")]
    dst: Ipv4Addr,

    #[clap(long, default_value_t = 64)]
    min_payload: usize,

    #[clap(long, default_value_t = 1400)]
    max_payload: usize,

    /// Stop after this many frames.
    #[clap(long)]
    count: Option<u64>,

    #[clap(long, default_value_t = 1)]
    seed: u64,
}

#[cfg(feature = "pcap")]
#[derive(Parser, Debug)]
struct ReplayArgs {
    /// Capture file to replay.
    file: std::path::PathBuf,

    /// Keep the capture timestamps.
    #[clap(long)]
    keep_timestamps: bool,
}

impl Args {
    fn source_config(&self) -> SourceConfig {
        let mode = match self.mode {
            Mode::Windowed => EmitMode::Windowed {
                window: Duration::from_millis(self.window_ms),
            },
            Mode::PerCycle => EmitMode::PerCycle,
        };
        SourceConfig {
            nic_address: self.nic.clone(),
            gpu_address: self.gpu.clone(),
            source_ip: self.source_ip.clone(),
            transport: match self.transport {
                Transport::Tcp => "tcp",
                Transport::Udp => "udp",
            }
            .to_owned(),
            semaphore_capacity: self.semaphores,
            rxq_descriptors: self.descriptors,
            engine: EngineConfig {
                mode,
                rx_timeout: Duration::from_micros(self.rx_timeout_us),
                max_packets_per_cycle: self.max_packets,
                max_packet_size: self.max_packet_size,
                ..EngineConfig::default()
            },
        }
    }
}

fn print_rows(table: &Table, rows: usize) {
    let column = |name: &str| table.column(name).and_then(|c| c.strings_to_host()).unwrap_or_default();
    let (src, dst) = (column("src_ip"), column("dst_ip"));
    let sizes = table
        .column("packet_size")
        .and_then(|c| c.values::<u32>())
        .unwrap_or_default();
    for i in 0..rows.min(table.num_rows()) {
        println!(
            "  {} > {} ({} bytes)",
            src.get(i).map_or("?", String::as_str),
            dst.get(i).map_or("?", String::as_str),
            sizes.get(i).copied().unwrap_or_default()
        );
    }
}

fn generate(platform: &Platform, nic: &str, args: &GenerateArgs, term: &AtomicBool) -> Result<()> {
    let address = nic.parse::<PciAddress>().with_context(|| format!("bad NIC address {nic}"))?;
    let wire = platform.nic(address).context("NIC is not on the platform")?;
    let template = FrameSpec::tcp(args.src, args.dst);
    let mut traffic = TrafficGenerator::new(template, args.min_payload..=args.max_payload, args.seed);
    let pause = (args.rate > 0).then(|| Duration::from_nanos(1_000_000_000 / args.rate));
    while !term.load(Ordering::SeqCst) && args.count.is_none_or(|n| traffic.sequence() < n) {
        wire.inject(&traffic.next_frame()?);
        if let Some(pause) = pause {
            thread::sleep(pause);
        }
    }
    info!(frames = traffic.sequence(), "traffic finished");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let config = args.source_config();
    let Args { traffic, debug, .. } = args;

    println!("Capture started with parameters:");
    println!("* nic: {}", config.nic_address);
    println!("* gpu: {}", config.gpu_address);
    println!(
        "* filter: {} {}",
        if config.source_ip.is_empty() { "any" } else { &config.source_ip },
        config.transport
    );
    println!("* mode: {:?}", config.engine.mode);
    println!("* debug: {}", if debug { "ON" } else { "OFF" });

    let platform = Platform::new();
    platform.add_nic(&config.nic_address, NicSpec::default())?;
    platform.add_gpu(&config.gpu_address, GpuSpec::default())?;

    let handle = source::launch(&platform, &config, gpunet_rs::columnar::DeviceTables)?;

    // Setup a termination flag (triggered on Ctrl+C).
    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        let exit = handle.exit_handle();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
            exit.request();
        })
        .context("setting Ctrl-C handler")?;
    }

    let rows = Arc::new(AtomicU64::new(0));
    let stats_handle = {
        let term = term.clone();
        let rows = rows.clone();
        thread::spawn(move || {
            let mut old_total = 0;
            while !term.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let total = rows.load(Ordering::SeqCst);
                println!("Captured pkt/sec: {}", total.saturating_sub(old_total));
                old_total = total;
            }
        })
    };

    let traffic_handle = {
        let term = term.clone();
        let platform = platform.clone();
        let nic = config.nic_address.clone();
        let exit = handle.exit_handle();
        thread::spawn(move || -> Result<()> {
            let result = match &traffic {
                Traffic::Generate(generate_args) => generate(&platform, &nic, generate_args, &term),
                #[cfg(feature = "pcap")]
                Traffic::Replay(replay_args) => {
                    let address = nic.parse::<PciAddress>().with_context(|| format!("bad NIC address {nic}"))?;
                    let wire = platform.nic(address).context("NIC is not on the platform")?;
                    let options = gpunet_rs::pcap::ReplayOptions {
                        keep_timestamps: replay_args.keep_timestamps,
                        exit: Some(exit.clone()),
                        ..Default::default()
                    };
                    gpunet_rs::pcap::replay(&replay_args.file, &wire, &options)
                        .map(drop)
                        .map_err(anyhow::Error::from)
                }
            };
            // Let the last window flush before stopping.
            thread::sleep(Duration::from_millis(200));
            exit.request();
            result
        })
    };

    for batch in handle.batches().iter() {
        let table = match batch {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "capture failed");
                break;
            }
        };
        rows.fetch_add(table.num_rows() as u64, Ordering::SeqCst);
        if debug {
            println!("batch: {} rows", table.num_rows());
            print_rows(&table, 4);
        }
    }

    term.store(true, Ordering::SeqCst);
    let stats = handle.stats();
    let pending = handle.join();
    traffic_handle.join().expect("Traffic thread panicked")?;
    stats_handle.join().expect("Stats thread panicked");
    println!(
        "Captured {} packets in {} batches ({} cycles, {} idle, {} missed by the queue)",
        stats.packets, stats.batches, stats.cycles, stats.idle_polls, stats.frames_missed
    );
    pending?;
    Ok(())
}
