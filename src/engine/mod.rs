//! Capture-and-batch engine.
//!
//! A dedicated poll thread drives the receive and gather kernels. In
//! [`EmitMode::Windowed`] it hands one [`PacketDataBuffer`] per non-empty
//! cycle to an accumulator thread, which concatenates everything that
//! arrives within the window into one table. In [`EmitMode::PerCycle`] the
//! poll thread builds and emits a table every non-empty cycle itself.
//!
//! [`PacketDataBuffer`]: crate::packet::PacketDataBuffer

mod accumulator;
mod batch;
mod capture;
pub mod handoff;

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{error, info};
use triomphe::Arc;

use self::accumulator::Accumulator;
use self::capture::CaptureLoop;
use crate::api::Columnar;
use crate::errors::{Error, Result};
use crate::gpu::{ExitCondition, ExitHandle, Gpu};
use crate::hw::{Context, FlowPipe, MAX_SEMAPHORES, ReceiveQueue, SemaphoreRing};
use crate::kernels::{MAX_PKT_RECEIVE, MAX_PKT_SIZE, PACKET_RX_TIMEOUT};
use crate::sim::Nic;

pub use self::accumulator::collect_window;

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitMode {
    /// Accumulate per-cycle buffers for `window` after the first arrives,
    /// then emit one table.
    Windowed { window: Duration },
    /// Emit one table per non-empty receive cycle.
    PerCycle,
}

impl Default for EmitMode {
    fn default() -> Self {
        EmitMode::Windowed {
            window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub mode: EmitMode,
    pub rx_timeout: Duration,
    pub max_packets_per_cycle: usize,
    pub max_packet_size: usize,
    /// Buffers in flight between the poll loop and the accumulator.
    pub handoff_capacity: usize,
    /// Batches waiting for the consumer.
    pub output_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EmitMode::default(),
            rx_timeout: PACKET_RX_TIMEOUT,
            max_packets_per_cycle: MAX_PKT_RECEIVE,
            max_packet_size: MAX_PKT_SIZE,
            handoff_capacity: 64,
            output_capacity: 16,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason: &str| {
            Err(Error::InvalidConfig {
                field,
                reason: reason.to_owned(),
            })
        };
        if self.rx_timeout.is_zero() {
            return invalid("rx_timeout", "must be positive");
        }
        if !(1..=MAX_PKT_RECEIVE).contains(&self.max_packets_per_cycle) {
            return invalid("max_packets_per_cycle", "must be in 1..=4096");
        }
        if !(64..=MAX_PKT_SIZE).contains(&self.max_packet_size) {
            return invalid("max_packet_size", "must be in 64..=4096");
        }
        if self.handoff_capacity == 0 {
            return invalid("handoff_capacity", "must be at least 1");
        }
        if self.output_capacity == 0 {
            return invalid("output_capacity", "must be at least 1");
        }
        if let EmitMode::Windowed { window } = self.mode {
            if window.is_zero() {
                return invalid("window", "must be positive");
            }
        }
        Ok(())
    }
}

/// Where the poll loop is in its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle,
    Polling,
    Draining,
    Gathering,
    Emitting,
    Stopped,
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(EngineState::Idle as u8))
    }

    pub(crate) fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> EngineState {
        match self.0.load(Ordering::Acquire) {
            0 => EngineState::Idle,
            1 => EngineState::Polling,
            2 => EngineState::Draining,
            3 => EngineState::Gathering,
            4 => EngineState::Emitting,
            _ => EngineState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    cycles: AtomicU64,
    idle_polls: AtomicU64,
    packets: AtomicU64,
    payload_bytes: AtomicU64,
    batches: AtomicU64,
    batch_rows: AtomicU64,
}

impl EngineStats {
    pub(crate) fn cycle(&self, packets: usize, payload_bytes: usize) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if packets == 0 {
            self.idle_polls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packets.fetch_add(packets as u64, Ordering::Relaxed);
            self.payload_bytes
                .fetch_add(payload_bytes as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn batch(&self, rows: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, nic: &Nic) -> EngineCounters {
        EngineCounters {
            frames_missed: nic.counters().rx_missed,
            cycles: self.cycles.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            payload_bytes: self.payload_bytes.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            batch_rows: self.batch_rows.load(Ordering::Relaxed),
        }
    }
}

/// Counters since the engine started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub cycles: u64,
    pub idle_polls: u64,
    pub packets: u64,
    pub payload_bytes: u64,
    pub batches: u64,
    pub batch_rows: u64,
    /// Frames the NIC could not queue because the receive queue was full.
    pub frames_missed: u64,
}

/// Hardware a running engine keeps alive. Fields drop in order.
struct Resources {
    _flow: Option<FlowPipe>,
    semaphores: SemaphoreRing,
    rxq: ReceiveQueue,
    _context: Arc<Context>,
}

pub struct CaptureEngine<C: Columnar> {
    config: EngineConfig,
    columnar: C,
    resources: Resources,
}

impl<C: Columnar> CaptureEngine<C> {
    pub fn new(
        config: EngineConfig,
        rxq: ReceiveQueue,
        semaphores: SemaphoreRing,
        flow: Option<FlowPipe>,
        columnar: C,
    ) -> Result<Self> {
        config.validate()?;
        debug_assert!(semaphores.capacity() <= MAX_SEMAPHORES);
        let context = rxq.context().clone();
        Ok(Self {
            config,
            columnar,
            resources: Resources {
                _flow: flow,
                semaphores,
                rxq,
                _context: context,
            },
        })
    }

    /// Starts the worker threads. The engine owns its hardware from here on
    /// and releases it when the poll loop ends.
    pub fn spawn(self) -> Result<EngineHandle<C::Batch>> {
        let Self {
            config,
            columnar,
            resources,
        } = self;
        let gpu = resources.rxq.context().gpu().clone();
        let nic = resources.rxq.context().nic().clone();
        let exit = ExitCondition::new(&gpu)?;
        let state = Arc::new(StateCell::new());
        let stats = Arc::new(EngineStats::default());
        let capture = CaptureLoop::new(
            gpu.create_stream(),
            &resources.rxq,
            &resources.semaphores,
            exit.device(),
            &config,
            state.clone(),
            stats.clone(),
        )?;
        let (out_tx, out_rx) = flume::bounded(config.output_capacity);
        let exit_handle = exit.host();

        let worker = match config.mode {
            EmitMode::PerCycle => {
                let state = state.clone();
                thread::spawn(move || {
                    let result = capture.run_per_cycle(&columnar, &out_tx);
                    drop((exit, resources));
                    finish(result, &state, &out_tx)
                })
            }
            EmitMode::Windowed { window } => {
                let (tx, rx) = handoff::handoff(config.handoff_capacity)?;
                let poller = thread::spawn(move || {
                    let result = capture.run_windowed(tx);
                    drop((exit, resources));
                    result
                });
                let accumulator =
                    Accumulator::new(columnar, gpu.create_stream(), window, stats.clone());
                let state = state.clone();
                thread::spawn(move || {
                    let result = accumulator.run(rx, &out_tx);
                    let polled = join(poller);
                    finish(polled.and(result), &state, &out_tx)
                })
            }
        };
        info!(mode = ?config.mode, "capture engine started");

        Ok(EngineHandle {
            exit: exit_handle,
            batches: out_rx,
            state,
            stats,
            gpu,
            nic,
            worker: Some(worker),
        })
    }
}

fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn finish<B>(result: Result<()>, state: &StateCell, out: &Sender<Result<B>>) -> Result<()> {
    state.set(EngineState::Stopped);
    match &result {
        Ok(()) => info!("capture engine stopped"),
        Err(e) => {
            error!(error = %e, "capture engine failed");
            let _ = out.send(Err(e.clone()));
        }
    }
    result
}

/// Control side of a running engine.
///
/// Dropping the handle stops the engine and discards undelivered batches.
pub struct EngineHandle<B> {
    exit: ExitHandle,
    batches: Receiver<Result<B>>,
    state: Arc<StateCell>,
    stats: Arc<EngineStats>,
    gpu: Gpu,
    nic: Nic,
    worker: Option<JoinHandle<Result<()>>>,
}

impl<B> EngineHandle<B> {
    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    /// Emitted batches, in capture order. A fatal engine error arrives as a
    /// final `Err` item.
    pub fn batches(&self) -> &Receiver<Result<B>> {
        &self.batches
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn stats(&self) -> EngineCounters {
        self.stats.snapshot(&self.nic)
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    /// Requests a stop, then waits as in [`EngineHandle::join`].
    pub fn stop(mut self) -> Result<Vec<B>> {
        self.exit.request();
        self.finish()
    }

    /// Waits for the engine to end and returns the batches nobody consumed,
    /// or the error that ended it.
    pub fn join(mut self) -> Result<Vec<B>> {
        self.finish()
    }

    fn finish(&mut self) -> Result<Vec<B>> {
        let mut pending = Vec::new();
        let mut failure = None;
        for item in self.batches.iter() {
            match item {
                Ok(batch) => pending.push(batch),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        let result = self.worker.take().map_or(Ok(()), join);
        match failure {
            Some(e) => Err(e),
            None => result.map(|()| pending),
        }
    }
}

impl<B> Drop for EngineHandle<B> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.exit.request();
            let _ = self.finish();
        }
    }
}

#[cfg(test)]
mod tests;
