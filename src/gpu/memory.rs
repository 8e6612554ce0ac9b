use std::fmt;
use std::mem::size_of;

use triomphe::Arc;

use super::{GpuInner, Stream};
use crate::errors::{CallSite, Error, Result, Status};

/// Bytes of device memory charged to the GPU until dropped.
pub struct MemoryLease {
    gpu: Arc<GpuInner>,
    bytes: usize,
}

impl MemoryLease {
    pub(super) fn new(gpu: Arc<GpuInner>, bytes: usize) -> Self {
        Self { gpu, bytes }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.gpu.release(self.bytes);
    }
}

impl fmt::Debug for MemoryLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryLease({} bytes)", self.bytes)
    }
}

/// Plain element types that may live in device memory.
pub trait DeviceValue: Copy + Default + Send + Sync + fmt::Debug + 'static {}

impl DeviceValue for u8 {}
impl DeviceValue for u16 {}
impl DeviceValue for u32 {}
impl DeviceValue for u64 {}
impl DeviceValue for i32 {}
impl DeviceValue for i64 {}

/// Exact-size typed allocation in GPU memory, tagged with the stream it was
/// populated on.
///
/// Host code only sees the contents through explicit copies
/// ([`DeviceBuffer::to_host`], [`DeviceBuffer::element`]); kernels get direct
/// slices.
pub struct DeviceBuffer<T: DeviceValue> {
    data: Vec<T>,
    stream: u32,
    _lease: MemoryLease,
}

impl<T: DeviceValue> DeviceBuffer<T> {
    #[track_caller]
    pub fn zeroed(stream: &Stream, len: usize) -> Result<Self> {
        let lease = stream.gpu().reserve(len * size_of::<T>())?;
        Ok(Self {
            data: vec![T::default(); len],
            stream: stream.id(),
            _lease: lease,
        })
    }

    /// Allocates and fills from host memory (H2D copy).
    #[track_caller]
    pub fn from_host(stream: &Stream, host: &[T]) -> Result<Self> {
        let lease = stream.gpu().reserve(std::mem::size_of_val(host))?;
        Ok(Self {
            data: host.to_vec(),
            stream: stream.id(),
            _lease: lease,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() * size_of::<T>()
    }

    pub fn stream_id(&self) -> u32 {
        self.stream
    }

    /// D2H copy of the whole buffer.
    pub fn to_host(&self) -> Vec<T> {
        self.data.clone()
    }

    pub fn element(&self, idx: usize) -> Option<T> {
        self.data.get(idx).copied()
    }

    /// D2D copy of `src` into `self` starting at element `offset`.
    #[track_caller]
    pub fn copy_from(&mut self, offset: usize, src: &DeviceBuffer<T>) -> Result<()> {
        let site = CallSite::caller();
        let Some(dst) = self.data.get_mut(offset..offset + src.len()) else {
            return Err(Error::KernelLaunch {
                site,
                kernel: "memcpy_d2d",
                status: Status::InvalidValue,
            });
        };
        dst.copy_from_slice(&src.data);
        Ok(())
    }

    pub(crate) fn device(&self) -> &[T] {
        &self.data
    }

    pub(crate) fn device_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: DeviceValue> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.data.len())
            .field("stream", &self.stream)
            .finish()
    }
}

/// Single value in device memory.
#[derive(Debug)]
pub struct DeviceScalar<T: DeviceValue> {
    buf: DeviceBuffer<T>,
}

impl<T: DeviceValue> DeviceScalar<T> {
    #[track_caller]
    pub fn new(stream: &Stream, value: T) -> Result<Self> {
        let buf = DeviceBuffer::from_host(stream, &[value])?;
        Ok(Self { buf })
    }

    /// D2H read.
    pub fn value(&self) -> T {
        self.buf.data[0]
    }

    /// H2D write.
    pub fn set_value(&mut self, value: T) {
        self.buf.data[0] = value;
    }

    pub(crate) fn device_set(&mut self, value: T) {
        self.buf.data[0] = value;
    }

    pub(crate) fn device_get(&self) -> T {
        self.buf.data[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Gpu;

    fn stream(capacity: usize) -> Stream {
        Gpu::new("ca:00.0".parse().unwrap(), capacity).create_stream()
    }

    #[test]
    fn buffers_charge_exact_size() {
        let stream = stream(1 << 20);
        let a = DeviceBuffer::<u64>::zeroed(&stream, 10).unwrap();
        let b = DeviceBuffer::<u16>::from_host(&stream, &[1, 2, 3]).unwrap();
        assert_eq!(stream.gpu().allocated_bytes(), 80 + 6);
        assert_eq!(a.stream_id(), stream.id());
        assert_eq!(b.to_host(), vec![1, 2, 3]);
        drop((a, b));
        assert_eq!(stream.gpu().allocated_bytes(), 0);
    }

    #[test]
    fn copy_lands_at_offset() {
        let stream = stream(1 << 20);
        let mut dst = DeviceBuffer::<u32>::zeroed(&stream, 5).unwrap();
        let src = DeviceBuffer::from_host(&stream, &[7u32, 8]).unwrap();
        dst.copy_from(2, &src).unwrap();
        assert_eq!(dst.to_host(), vec![0, 0, 7, 8, 0]);
        assert!(dst.copy_from(4, &src).is_err());
    }

    #[test]
    fn oversized_allocation_fails() {
        let stream = stream(64);
        assert!(matches!(
            DeviceBuffer::<u64>::zeroed(&stream, 9),
            Err(Error::Allocation { requested: 72, .. })
        ));
    }

    #[test]
    fn scalar_round_trip() {
        let stream = stream(64);
        let mut s = DeviceScalar::new(&stream, 3u32).unwrap();
        s.set_value(9);
        assert_eq!(s.value(), 9);
    }
}
