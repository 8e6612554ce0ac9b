use super::{PacketFields, ReceiveScratch};
use crate::errors::Result;
use crate::gpu::{DeviceBuffer, DeviceScalar, Stream};
use crate::hw::{SemaphoreDeviceView, SlotState};
use crate::packet::{HEADER_STRIDE, PacketDataBuffer};

/// Exact-size outputs of the per-field gather.
pub struct GatherOutputs {
    pub fields: PacketFields,
    /// `count + 1` payload offsets into `data`.
    pub data_offsets: DeviceBuffer<u32>,
    pub data: DeviceBuffer<u8>,
}

impl GatherOutputs {
    #[track_caller]
    pub fn allocate(stream: &Stream, count: usize, payload_bytes: usize) -> Result<Self> {
        Ok(Self {
            fields: PacketFields::allocate(stream, count)?,
            data_offsets: DeviceBuffer::zeroed(stream, count + 1)?,
            data: DeviceBuffer::zeroed(stream, payload_bytes)?,
        })
    }
}

fn ready_slot(semaphores: &SemaphoreDeviceView, index: &DeviceScalar<u32>) -> Option<(usize, usize)> {
    let slot = index.device_get() as usize % semaphores.len();
    match semaphores.state(slot) {
        SlotState::Ready { packets, .. } => Some((slot, packets as usize)),
        SlotState::Free => None,
    }
}

/// Scatters the packets signalled at the cursor slot into one column per
/// header field plus payload offsets and bytes, then frees the slot.
#[track_caller]
pub fn packet_gather_kernel(
    stream: &Stream,
    semaphores: &SemaphoreDeviceView,
    semaphore_index: &DeviceScalar<u32>,
    scratch: &ReceiveScratch,
    out: &mut GatherOutputs,
) -> Result<()> {
    stream.launch("packet_gather_kernel", || {
        let Some((slot, count)) = ready_slot(semaphores, semaphore_index) else {
            return;
        };
        let count = count.min(out.fields.len());
        let mut offset = 0usize;
        for i in 0..count {
            let (rec, payload) = scratch.packet(i);
            let end = (offset + payload.len()).min(out.data.len());
            out.data.device_mut()[offset..end].copy_from_slice(&payload[..end - offset]);
            out.data_offsets.device_mut()[i] = offset as u32;
            out.fields.store(i, &rec, (end - offset) as u32);
            offset = end;
        }
        out.data_offsets.device_mut()[count] = offset as u32;
        semaphores.release(slot);
    })
}

/// Packs the packets signalled at the cursor slot into a
/// [`PacketDataBuffer`], then frees the slot.
#[track_caller]
pub fn gather_packet_data(
    stream: &Stream,
    semaphores: &SemaphoreDeviceView,
    semaphore_index: &DeviceScalar<u32>,
    scratch: &ReceiveScratch,
    out: &mut PacketDataBuffer,
) -> Result<()> {
    let count = out.num_packets();
    stream.launch("gather_packet_data", || {
        let Some((slot, ready)) = ready_slot(semaphores, semaphore_index) else {
            return;
        };
        let (header, payload_out, sizes) = out.parts_mut();
        let mut offset = 0usize;
        for i in 0..count.min(ready) {
            let (rec, payload) = scratch.packet(i);
            rec.encode(&mut header.device_mut()[i * HEADER_STRIDE..]);
            let end = (offset + payload.len()).min(payload_out.len());
            payload_out.device_mut()[offset..end].copy_from_slice(&payload[..end - offset]);
            sizes.device_mut()[i] = (end - offset) as u32;
            offset = end;
        }
        semaphores.release(slot);
    })
}
