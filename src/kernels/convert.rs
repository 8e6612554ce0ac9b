use super::PacketFields;
use crate::errors::Result;
use crate::gpu::{DeviceBuffer, Stream};
use crate::packet::{HEADER_STRIDE, HeaderRecord, PacketDataBuffer};

/// Splits the packed header records of `buffer` into per-field columns.
#[track_caller]
pub fn unpack_headers(stream: &Stream, buffer: &PacketDataBuffer) -> Result<PacketFields> {
    let mut fields = PacketFields::allocate(stream, buffer.num_packets())?;
    stream.launch("unpack_headers", || {
        let header = buffer.header().device();
        let sizes = buffer.payload_sizes().device();
        for (i, raw) in header.chunks_exact(HEADER_STRIDE).enumerate() {
            fields.store(i, &HeaderRecord::decode(raw), sizes[i]);
        }
    })?;
    Ok(fields)
}

/// Exclusive prefix sum of `sizes` with the grand total appended, so row
/// `i` spans `offsets[i]..offsets[i + 1]`.
#[track_caller]
pub fn sizes_to_offsets(stream: &Stream, sizes: &DeviceBuffer<u32>) -> Result<DeviceBuffer<u32>> {
    let mut offsets = DeviceBuffer::zeroed(stream, sizes.len() + 1)?;
    stream.launch("sizes_to_offsets", || {
        let out = offsets.device_mut();
        let mut acc = 0u32;
        for (i, size) in sizes.device().iter().enumerate() {
            out[i] = acc;
            acc += size;
        }
        out[sizes.len()] = acc;
    })?;
    Ok(offsets)
}
