use std::time::{Duration, Instant};

use flume::Sender;
use tracing::{debug, trace};
use triomphe::Arc;

use super::EngineStats;
use super::batch::table_from_packet_data;
use super::handoff::{HandoffReceiver, PopError, TryPopError};
use crate::api::Columnar;
use crate::errors::Result;
use crate::gpu::Stream;
use crate::packet::PacketDataBuffer;

/// Collects one window's worth of items.
///
/// Blocks for the first item, then takes whatever else arrives within
/// `window` of it. The flag is `true` once the channel is closed and empty;
/// items received before that are still returned.
pub fn collect_window<T>(rx: &HandoffReceiver<T>, window: Duration) -> (Vec<T>, bool) {
    let first = match rx.pop() {
        Ok(item) => item,
        Err(PopError) => return (Vec::new(), true),
    };
    let deadline = Instant::now() + window;
    let mut items = vec![first];
    loop {
        match rx.pop_until(deadline) {
            Ok(item) => items.push(item),
            Err(TryPopError::Empty) => return (items, false),
            Err(TryPopError::Closed) => return (items, true),
        }
    }
}

/// Concatenates the buffers of each window and turns them into one table.
pub(crate) struct Accumulator<C> {
    columnar: C,
    stream: Stream,
    window: Duration,
    stats: Arc<EngineStats>,
}

impl<C: Columnar> Accumulator<C> {
    pub(crate) fn new(columnar: C, stream: Stream, window: Duration, stats: Arc<EngineStats>) -> Self {
        Self {
            columnar,
            stream,
            window,
            stats,
        }
    }

    /// Runs until the poll loop closes the handoff, flushing a final partial
    /// window, or until the consumer goes away.
    pub(crate) fn run(self, rx: HandoffReceiver<PacketDataBuffer>, out: &Sender<Result<C::Batch>>) -> Result<()> {
        loop {
            let (buffers, closed) = collect_window(&rx, self.window);
            if !buffers.is_empty() {
                let batch = self.emit(buffers)?;
                if out.send(Ok(batch)).is_err() {
                    trace!("consumer gone");
                    return Ok(());
                }
            }
            if closed {
                return Ok(());
            }
        }
    }

    fn emit(&self, buffers: Vec<PacketDataBuffer>) -> Result<C::Batch> {
        let parts = buffers.len();
        let merged = PacketDataBuffer::concat(&self.stream, buffers)?;
        let rows = merged.num_packets();
        let payload_bytes = merged.payload_bytes();
        let table = table_from_packet_data(&self.columnar, &self.stream, merged)?;
        self.stats.batch(rows);
        debug!(parts, rows, payload_bytes, "window emitted");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::columnar::{DeviceTables, Table};
    use crate::engine::handoff::handoff;
    use crate::gpu::{Fault, Gpu};
    use crate::packet::HeaderRecord;

    fn stream() -> Stream {
        Gpu::new("ca:00.0".parse().unwrap(), 1 << 24).create_stream()
    }

    fn buffer(stream: &Stream, seqs: std::ops::Range<u64>, payload_len: usize) -> PacketDataBuffer {
        let payloads: Vec<Vec<u8>> = seqs.clone().map(|s| vec![s as u8; payload_len]).collect();
        let packets: Vec<(HeaderRecord, &[u8])> = seqs
            .zip(payloads.iter())
            .map(|(s, p)| {
                let rec = HeaderRecord {
                    timestamp: s,
                    ..Default::default()
                };
                (rec, p.as_slice())
            })
            .collect();
        PacketDataBuffer::from_packets(stream, &packets).unwrap()
    }

    fn accumulate(stream: &Stream, buffers: Vec<PacketDataBuffer>, window: Duration) -> Vec<Result<Table>> {
        let (tx, rx) = handoff(16).unwrap();
        for b in buffers {
            tx.push(b).unwrap();
        }
        drop(tx);
        let (out_tx, out_rx) = flume::unbounded();
        let acc = Accumulator::new(DeviceTables, stream.clone(), window, Arc::new(EngineStats::default()));
        acc.run(rx, &out_tx).unwrap();
        drop(out_tx);
        out_rx.iter().collect()
    }

    #[test]
    fn preserves_order_across_buffers() {
        let stream = stream();
        let batches = accumulate(
            &stream,
            vec![buffer(&stream, 1..6, 2), buffer(&stream, 6..10, 2)],
            Duration::from_secs(1),
        );
        assert_eq!(batches.len(), 1);
        let table = batches.into_iter().next().unwrap().unwrap();
        assert_eq!(
            table.column("timestamp").unwrap().values::<u64>(),
            Some((1..10).collect())
        );
        assert_eq!(table.column("data").unwrap().bytes(5), Some(vec![6, 6]));
    }

    #[test]
    fn one_batch_per_window_with_summed_payload() {
        let stream = stream();
        let batches = accumulate(
            &stream,
            vec![buffer(&stream, 0..100, 3), buffer(&stream, 100..150, 2)],
            Duration::from_secs(1),
        );
        assert_eq!(batches.len(), 1);
        let table = batches.into_iter().next().unwrap().unwrap();
        assert_eq!(table.num_rows(), 150);
        let sizes = table.column("packet_size").unwrap().values::<u32>().unwrap();
        assert_eq!(sizes.iter().sum::<u32>(), 400);
    }

    #[test]
    fn close_flushes_partial_window() {
        let stream = stream();
        let start = Instant::now();
        let batches = accumulate(&stream, vec![buffer(&stream, 0..4, 1)], Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_ref().unwrap().num_rows(), 4);
    }

    #[test]
    fn closed_and_empty_emits_nothing() {
        let stream = stream();
        assert!(accumulate(&stream, Vec::new(), Duration::from_millis(1)).is_empty());
    }

    #[test]
    fn window_ends_without_closing() {
        let (tx, rx) = handoff(4).unwrap();
        tx.push(1).unwrap();
        let (items, closed) = collect_window(&rx, Duration::from_millis(5));
        assert_eq!(items, vec![1]);
        assert!(!closed);

        let late = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            tx.push(2).unwrap();
        });
        let (items, _) = collect_window(&rx, Duration::from_millis(5));
        late.join().unwrap();
        assert_eq!(items, vec![2]);
        let (items, closed) = collect_window(&rx, Duration::from_millis(5));
        assert!(items.is_empty());
        assert!(closed);
    }

    #[test]
    fn concat_failure_is_returned() {
        let stream = stream();
        let bufs = vec![buffer(&stream, 0..2, 1), buffer(&stream, 2..4, 1)];
        stream.gpu().inject_fault(Fault::StreamSync);
        let (tx, rx) = handoff(4).unwrap();
        for b in bufs {
            tx.push(b).unwrap();
        }
        drop(tx);
        let (out_tx, out_rx) = flume::unbounded();
        let acc = Accumulator::new(DeviceTables, stream.clone(), Duration::from_secs(1), Arc::new(EngineStats::default()));
        assert!(matches!(acc.run(rx, &out_tx), Err(crate::errors::Error::StreamSync { .. })));
        assert!(out_rx.is_empty());
    }
}
