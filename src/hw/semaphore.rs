use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use tracing::info;
use triomphe::Arc;

use super::Context;
use crate::errors::{Error, Result, Status};
use crate::gpu::{DeviceScalar, MemoryLease, Stream};

/// Upper bound on semaphore ring capacity.
pub const MAX_SEMAPHORES: u16 = 1024;

/// Device footprint of one slot: status word plus the two counts.
const SLOT_BYTES: usize = 3 * size_of::<u32>();

const FREE: u8 = 0;
const READY: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Ready { packets: u32, payload_bytes: u32 },
}

#[derive(Default)]
struct Slot {
    status: AtomicU8,
    packets: AtomicU32,
    payload_bytes: AtomicU32,
}

struct SlotTable {
    slots: Box<[Slot]>,
}

impl SlotTable {
    fn state(&self, idx: usize) -> SlotState {
        let slot = &self.slots[idx];
        match slot.status.load(Ordering::Acquire) {
            READY => SlotState::Ready {
                packets: slot.packets.load(Ordering::Relaxed),
                payload_bytes: slot.payload_bytes.load(Ordering::Relaxed),
            },
            _ => SlotState::Free,
        }
    }
}

/// Ring of device-visible slots through which the receive kernel tells the
/// gather stage how much it delivered.
pub struct SemaphoreRing {
    table: Arc<SlotTable>,
    capacity: u16,
    _lease: MemoryLease,
    context: Arc<Context>,
}

impl SemaphoreRing {
    pub fn create(context: &Arc<Context>, capacity: u16) -> Result<Self> {
        if capacity == 0 || capacity > MAX_SEMAPHORES {
            return Err(Error::InvalidConfig {
                field: "semaphore_capacity",
                reason: format!("{capacity} not in 1..={MAX_SEMAPHORES}"),
            });
        }
        let lease = context.gpu().reserve(capacity as usize * SLOT_BYTES)?;
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        info!(capacity, "semaphore ring created");
        Ok(Self {
            table: Arc::new(SlotTable { slots }),
            capacity,
            _lease: lease,
            context: context.clone(),
        })
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn device_view(&self) -> SemaphoreDeviceView {
        SemaphoreDeviceView {
            table: self.table.clone(),
        }
    }

    pub fn host_view(&self) -> SemaphoreHostView {
        SemaphoreHostView {
            table: self.table.clone(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

/// Read-only host access to slot states.
#[derive(Clone)]
pub struct SemaphoreHostView {
    table: Arc<SlotTable>,
}

impl SemaphoreHostView {
    pub fn state(&self, idx: usize) -> Option<SlotState> {
        (idx < self.table.slots.len()).then(|| self.table.state(idx))
    }
}

/// Kernel-side access to the ring.
#[derive(Clone)]
pub struct SemaphoreDeviceView {
    table: Arc<SlotTable>,
}

impl SemaphoreDeviceView {
    pub(crate) fn len(&self) -> usize {
        self.table.slots.len()
    }

    pub(crate) fn state(&self, idx: usize) -> SlotState {
        self.table.state(idx)
    }

    /// Marks a free slot ready. A slot that was not consumed yet is left
    /// untouched and reported as [`Status::Again`].
    pub(crate) fn signal(&self, idx: usize, packets: u32, payload_bytes: u32) -> std::result::Result<(), Status> {
        let slot = &self.table.slots[idx];
        if slot.status.load(Ordering::Acquire) != FREE {
            return Err(Status::Again);
        }
        slot.packets.store(packets, Ordering::Relaxed);
        slot.payload_bytes.store(payload_bytes, Ordering::Relaxed);
        slot.status.store(READY, Ordering::Release);
        Ok(())
    }

    pub(crate) fn release(&self, idx: usize) {
        let slot = &self.table.slots[idx];
        slot.packets.store(0, Ordering::Relaxed);
        slot.payload_bytes.store(0, Ordering::Relaxed);
        slot.status.store(FREE, Ordering::Release);
    }
}

/// Index of the next slot to consume, kept in device memory.
#[derive(Debug)]
pub struct SemaphoreCursor {
    index: DeviceScalar<u32>,
    capacity: u16,
}

impl SemaphoreCursor {
    #[track_caller]
    pub fn new(stream: &Stream, capacity: u16) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig {
                field: "semaphore_capacity",
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(Self {
            index: DeviceScalar::new(stream, 0)?,
            capacity,
        })
    }

    pub fn get(&self) -> u32 {
        self.index.value()
    }

    /// Reads the current index back and writes `(old + 1) % capacity`.
    /// Returns the new index.
    pub fn advance(&mut self) -> u32 {
        let next = (self.index.value() + 1) % self.capacity as u32;
        self.index.set_value(next);
        next
    }

    pub(crate) fn device(&self) -> &DeviceScalar<u32> {
        &self.index
    }
}
