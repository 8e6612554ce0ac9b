use std::sync::atomic::{AtomicU32, Ordering};

use triomphe::Arc;

use super::{Gpu, MemoryLease};
use crate::errors::Result;

/// Exit flag in memory mapped for both the CPU and the GPU.
///
/// The host side is the single writer; kernels only read it.
pub struct ExitCondition {
    cell: Arc<AtomicU32>,
    _lease: MemoryLease,
}

impl ExitCondition {
    #[track_caller]
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let lease = gpu.reserve(size_of::<u32>())?;
        Ok(Self {
            cell: Arc::new(AtomicU32::new(0)),
            _lease: lease,
        })
    }

    pub fn host(&self) -> ExitHandle {
        ExitHandle {
            cell: self.cell.clone(),
        }
    }

    pub fn device(&self) -> DeviceFlag {
        DeviceFlag {
            cell: self.cell.clone(),
        }
    }
}

/// Host view of the exit flag. Cloning shares the same flag.
#[derive(Clone, Debug)]
pub struct ExitHandle {
    cell: Arc<AtomicU32>,
}

impl ExitHandle {
    /// Requests a stop. Returns `false` if one was already requested.
    pub fn request(&self) -> bool {
        self.cell.swap(1, Ordering::Release) == 0
    }

    pub fn is_requested(&self) -> bool {
        self.cell.load(Ordering::Acquire) != 0
    }
}

/// Device view of the exit flag.
#[derive(Clone, Debug)]
pub struct DeviceFlag {
    cell: Arc<AtomicU32>,
}

impl DeviceFlag {
    pub(crate) fn is_set(&self) -> bool {
        self.cell.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_write_is_seen_by_device() {
        let gpu = Gpu::new("ca:00.0".parse().unwrap(), 64);
        let exit = ExitCondition::new(&gpu).unwrap();
        let (host, device) = (exit.host(), exit.device());
        assert!(!device.is_set());
        assert!(host.request());
        assert!(!host.clone().request());
        assert!(device.is_set());
        drop(exit);
        assert_eq!(gpu.allocated_bytes(), 0);
        assert!(host.is_requested());
    }
}
