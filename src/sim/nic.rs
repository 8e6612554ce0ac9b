use std::sync::atomic::{AtomicU64, Ordering};

use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{trace, warn};
use triomphe::Arc;

use super::flow::{FlowEngine, FlowKey, Verdict};
use super::platform::PciAddress;
use super::wire_timestamp;
use crate::errors::Status;

/// Static properties of a NIC model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NicSpec {
    /// Hardware receive queues available to flow steering.
    pub max_queues: u16,
    /// Descriptors per queue the hardware accepts at most.
    pub max_descriptors: u32,
    /// Can land packets directly in GPU memory.
    pub gpudirect: bool,
    pub port_id: u16,
}

impl Default for NicSpec {
    fn default() -> Self {
        Self {
            max_queues: 4,
            max_descriptors: 16384,
            gpudirect: true,
            port_id: 0,
        }
    }
}

/// A frame as delivered into a receive queue.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Box<[u8]>,
    pub timestamp_ns: u64,
}

/// Outcome of putting one frame on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Queued(u16),
    /// Dropped by the flow table.
    Dropped,
    /// Steered to a queue that was full or gone.
    Missed(u16),
}

/// Snapshot of the NIC's ingress counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NicCounters {
    pub rx_frames: u64,
    pub rx_queued: u64,
    pub rx_dropped: u64,
    pub rx_missed: u64,
}

#[derive(Default)]
struct Counters {
    rx_frames: AtomicU64,
    rx_queued: AtomicU64,
    rx_dropped: AtomicU64,
    rx_missed: AtomicU64,
}

struct NicInner {
    pci: PciAddress,
    spec: NicSpec,
    flow: Mutex<FlowEngine>,
    queues: Mutex<Vec<Option<Sender<RawFrame>>>>,
    counters: Counters,
}

/// Handle to a NIC. The same handle serves the driver side (queues, flow
/// table) and the wire side ([`Nic::inject`]).
#[derive(Clone)]
pub struct Nic {
    inner: Arc<NicInner>,
}

impl std::fmt::Debug for Nic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nic")
            .field("pci", &self.inner.pci)
            .field("spec", &self.inner.spec)
            .finish()
    }
}

impl Nic {
    pub(super) fn new(pci: PciAddress, spec: NicSpec) -> Self {
        Self {
            inner: Arc::new(NicInner {
                pci,
                spec,
                flow: Mutex::new(FlowEngine::default()),
                queues: Mutex::new(vec![None; spec.max_queues as usize]),
                counters: Counters::default(),
            }),
        }
    }

    pub fn pci_address(&self) -> PciAddress {
        self.inner.pci
    }

    pub fn spec(&self) -> NicSpec {
        self.inner.spec
    }

    pub fn counters(&self) -> NicCounters {
        let c = &self.inner.counters;
        NicCounters {
            rx_frames: c.rx_frames.load(Ordering::Relaxed),
            rx_queued: c.rx_queued.load(Ordering::Relaxed),
            rx_dropped: c.rx_dropped.load(Ordering::Relaxed),
            rx_missed: c.rx_missed.load(Ordering::Relaxed),
        }
    }

    /// Puts a frame on the wire, stamped with the current time.
    pub fn inject(&self, frame: &[u8]) -> Delivery {
        self.inject_at(frame, wire_timestamp())
    }

    pub fn inject_at(&self, frame: &[u8], timestamp_ns: u64) -> Delivery {
        let c = &self.inner.counters;
        c.rx_frames.fetch_add(1, Ordering::Relaxed);

        let key = FlowKey::from_frame(frame);
        let verdict = self.inner.flow.lock().classify(&key);
        let Verdict::Queue(queue) = verdict else {
            c.rx_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(?key, "frame dropped by flow table");
            return Delivery::Dropped;
        };

        let sender = self
            .inner
            .queues
            .lock()
            .get(queue as usize)
            .cloned()
            .flatten();
        let raw = RawFrame {
            data: frame.into(),
            timestamp_ns,
        };
        match sender.map(|tx| tx.try_send(raw)) {
            Some(Ok(())) => {
                c.rx_queued.fetch_add(1, Ordering::Relaxed);
                Delivery::Queued(queue)
            }
            Some(Err(TrySendError::Full(_))) => {
                let missed = c.rx_missed.fetch_add(1, Ordering::Relaxed) + 1;
                if missed.is_power_of_two() {
                    warn!(queue, missed, "receive queue full, frames missed");
                }
                Delivery::Missed(queue)
            }
            Some(Err(TrySendError::Disconnected(_))) | None => {
                c.rx_missed.fetch_add(1, Ordering::Relaxed);
                Delivery::Missed(queue)
            }
        }
    }

    pub(crate) fn flow(&self) -> MutexGuard<'_, FlowEngine> {
        self.inner.flow.lock()
    }

    /// Takes a free hardware queue with room for `descriptors` frames.
    pub(crate) fn rxq_create(&self, descriptors: u32) -> Result<HwRxq, Status> {
        if descriptors == 0 || descriptors > self.inner.spec.max_descriptors {
            return Err(Status::InvalidValue);
        }
        let mut queues = self.inner.queues.lock();
        let id = queues
            .iter()
            .position(Option::is_none)
            .ok_or(Status::NoMemory)?;
        let (tx, rx) = flume::bounded(descriptors as usize);
        queues[id] = Some(tx);
        Ok(HwRxq {
            id: id as u16,
            rx,
            nic: self.inner.clone(),
        })
    }
}

/// A hardware receive queue; returns its slot to the NIC on drop.
pub(crate) struct HwRxq {
    id: u16,
    rx: Receiver<RawFrame>,
    nic: Arc<NicInner>,
}

impl HwRxq {
    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn receiver(&self) -> Receiver<RawFrame> {
        self.rx.clone()
    }
}

impl Drop for HwRxq {
    fn drop(&mut self) {
        if let Some(slot) = self.nic.queues.lock().get_mut(self.id as usize) {
            *slot = None;
        }
    }
}
