use std::time::{Duration, Instant};

use flume::RecvTimeoutError;
use tracing::trace;

use super::ReceiveScratch;
use crate::errors::Result;
use crate::gpu::{DeviceFlag, DeviceScalar, Stream};
use crate::hw::{RxqDeviceView, SemaphoreDeviceView, SlotState};
use crate::packet::HeaderRecord;

/// Granularity at which a waiting receive re-checks the exit flag.
const EXIT_POLL_SLICE: Duration = Duration::from_micros(100);

pub struct ReceiveArgs<'a> {
    pub rxq: &'a RxqDeviceView,
    pub semaphores: &'a SemaphoreDeviceView,
    pub semaphore_index: &'a DeviceScalar<u32>,
    pub packet_count: &'a mut DeviceScalar<u32>,
    pub payload_total: &'a mut DeviceScalar<u32>,
    pub scratch: &'a mut ReceiveScratch,
    pub exit: &'a DeviceFlag,
    pub timeout: Duration,
}

/// Waits up to `timeout` for packets on the queue and lands at most
/// `scratch.max_packets()` of them, then signals the semaphore slot at the
/// cursor with the count and total payload size.
///
/// Writes zero to the count when nothing arrived, when the exit flag was
/// raised, or when the slot at the cursor has not been consumed yet.
#[track_caller]
pub fn packet_receive_kernel(stream: &Stream, args: ReceiveArgs<'_>) -> Result<()> {
    stream.launch("packet_receive_kernel", move || receive(args))
}

fn receive(args: ReceiveArgs<'_>) {
    let ReceiveArgs {
        rxq,
        semaphores,
        semaphore_index,
        packet_count,
        payload_total,
        scratch,
        exit,
        timeout,
    } = args;

    packet_count.device_set(0);
    payload_total.device_set(0);

    let slot = semaphore_index.device_get() as usize % semaphores.len();
    if semaphores.state(slot) != SlotState::Free {
        trace!(slot, "semaphore slot busy");
        return;
    }

    let frames = rxq.frames();
    let deadline = Instant::now() + timeout;
    let max_size = scratch.max_packet_size;
    let mut count = 0usize;
    let mut payload = 0u32;

    while count < scratch.max_packets && !exit.is_set() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let frame = match frames.recv_timeout(EXIT_POLL_SLICE.min(deadline - now)) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let len = frame.data.len().min(max_size);
        let at = count * max_size;
        scratch.bytes.device_mut()[at..at + len].copy_from_slice(&frame.data[..len]);
        scratch.sizes.device_mut()[count] = len as u32;
        scratch.timestamps.device_mut()[count] = frame.timestamp_ns;

        let (_, body) = HeaderRecord::from_frame(&frame.data[..len], frame.timestamp_ns);
        payload += body.len() as u32;
        count += 1;
    }

    if count == 0 {
        return;
    }
    // The slot was checked free above and only this kernel signals it.
    if semaphores.signal(slot, count as u32, payload).is_ok() {
        packet_count.device_set(count as u32);
        payload_total.device_set(payload);
    }
}
