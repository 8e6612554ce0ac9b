//! Seam between the capture engine and the columnar library it feeds.

use crate::columnar::{Column, ColumnValue};
use crate::errors::Result;
use crate::gpu::{DeviceBuffer, Stream};

/// Column names of every emitted batch, in order.
pub const BATCH_COLUMNS: [&str; 12] = [
    "timestamp",
    "src_mac",
    "dst_mac",
    "src_ip",
    "dst_ip",
    "src_port",
    "dst_port",
    "packet_size",
    "tcp_flags",
    "ether_type",
    "next_proto_id",
    "data",
];

/// Columnar library the engine hands device buffers to.
///
/// Implementations take ownership of the buffers they are given; the
/// engine never touches a buffer again after passing it in.
pub trait Columnar: Send + 'static {
    /// What one emitted batch becomes.
    type Batch: Send + 'static;

    fn make_column<T: ColumnValue>(&self, values: DeviceBuffer<T>) -> Result<Column>;

    fn make_strings(&self, offsets: DeviceBuffer<u32>, chars: DeviceBuffer<u8>) -> Result<Column>;

    /// 48-bit integers to `aa:bb:cc:dd:ee:ff` strings.
    fn integers_to_mac(&self, stream: &Stream, macs: &DeviceBuffer<u64>) -> Result<Column>;

    /// 32-bit integers to dotted-quad strings.
    fn integers_to_ipv4(&self, stream: &Stream, ips: &DeviceBuffer<u32>) -> Result<Column>;

    fn make_table(&self, columns: Vec<(&'static str, Column)>) -> Result<Self::Batch>;
}
