//! GPU device model: memory accounting, streams, device buffers and pinned
//! host/device cells.
//!
//! Every allocation is charged against the device's VRAM capacity and
//! released when the owning buffer is dropped, so callers can assert that a
//! pipeline leaves no device memory behind.

mod memory;
mod pinned;
mod stream;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use triomphe::Arc;

pub use memory::{DeviceBuffer, DeviceScalar, DeviceValue, MemoryLease};
pub use pinned::{DeviceFlag, ExitCondition, ExitHandle};
pub use stream::Stream;

use crate::errors::{CallSite, Error, Result};
use crate::sim::PciAddress;

/// One-shot failure armed on a device, consumed by the next matching call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The next launch of the named kernel is rejected.
    KernelLaunch(&'static str),
    /// The next stream synchronization reports a device error.
    StreamSync,
    /// The next memory reservation fails as if the device were full.
    Allocation,
}

pub(crate) struct GpuInner {
    pci: PciAddress,
    capacity: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
    live_allocations: AtomicUsize,
    allocations_made: AtomicU64,
    next_stream: AtomicU32,
    faults: Mutex<Vec<Fault>>,
}

impl GpuInner {
    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
    }

    fn take_fault(&self, fault: Fault) -> bool {
        let mut faults = self.faults.lock();
        if let Some(pos) = faults.iter().position(|f| *f == fault) {
            faults.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Handle to an opened GPU. Cheap to clone.
#[derive(Clone)]
pub struct Gpu {
    inner: Arc<GpuInner>,
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("pci", &self.inner.pci)
            .field("capacity", &self.inner.capacity)
            .field("used", &self.allocated_bytes())
            .finish()
    }
}

impl Gpu {
    pub(crate) fn new(pci: PciAddress, capacity: usize) -> Self {
        Self {
            inner: Arc::new(GpuInner {
                pci,
                capacity,
                used: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                live_allocations: AtomicUsize::new(0),
                allocations_made: AtomicU64::new(0),
                next_stream: AtomicU32::new(1),
                faults: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn pci_address(&self) -> PciAddress {
        self.inner.pci
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently held by live allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    pub fn live_allocations(&self) -> usize {
        self.inner.live_allocations.load(Ordering::Acquire)
    }

    /// Monotonic count of every allocation ever made on this device.
    pub fn allocations_made(&self) -> u64 {
        self.inner.allocations_made.load(Ordering::Acquire)
    }

    /// Creates a non-blocking execution stream.
    pub fn create_stream(&self) -> Stream {
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        Stream::new(id, self.clone())
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.inner.faults.lock().push(fault);
    }

    pub(crate) fn take_fault(&self, fault: Fault) -> bool {
        self.inner.take_fault(fault)
    }

    /// Charges `bytes` against the device capacity.
    #[track_caller]
    pub fn reserve(&self, bytes: usize) -> Result<MemoryLease> {
        let site = CallSite::caller();
        let inner = &self.inner;
        let mut used = inner.used.load(Ordering::Acquire);
        if inner.take_fault(Fault::Allocation) {
            return Err(Error::Allocation {
                site,
                requested: bytes,
                available: inner.capacity.saturating_sub(used),
            });
        }
        loop {
            let available = inner.capacity.saturating_sub(used);
            if bytes > available {
                return Err(Error::Allocation {
                    site,
                    requested: bytes,
                    available,
                });
            }
            match inner.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }
        inner.peak.fetch_max(used + bytes, Ordering::AcqRel);
        inner.live_allocations.fetch_add(1, Ordering::AcqRel);
        inner.allocations_made.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryLease::new(self.inner.clone(), bytes))
    }
}
