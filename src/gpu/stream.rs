use super::{Fault, Gpu};
use crate::errors::{CallSite, Error, Result, Status};

/// In-order execution stream on one GPU.
///
/// Kernels run to completion at launch; [`Stream::synchronize`] is still the
/// only point at which asynchronous device errors are reported.
#[derive(Clone, Debug)]
pub struct Stream {
    id: u32,
    gpu: Gpu,
}

impl Stream {
    pub(super) fn new(id: u32, gpu: Gpu) -> Self {
        Self { id, gpu }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    #[track_caller]
    pub fn launch<R>(&self, kernel: &'static str, body: impl FnOnce() -> R) -> Result<R> {
        if self.gpu.take_fault(Fault::KernelLaunch(kernel)) {
            return Err(Error::KernelLaunch {
                site: CallSite::caller(),
                kernel,
                status: Status::Driver,
            });
        }
        Ok(body())
    }

    #[track_caller]
    pub fn synchronize(&self) -> Result<()> {
        if self.gpu.take_fault(Fault::StreamSync) {
            return Err(Error::StreamSync {
                site: CallSite::caller(),
                stream: self.id,
                status: Status::Driver,
            });
        }
        Ok(())
    }
}
