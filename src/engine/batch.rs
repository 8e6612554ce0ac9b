use crate::api::{BATCH_COLUMNS, Columnar};
use crate::errors::Result;
use crate::gpu::{DeviceBuffer, Stream};
use crate::kernels::{PacketFields, sizes_to_offsets, unpack_headers};
use crate::packet::PacketDataBuffer;

/// Hands per-field device columns to the columnar library as one table.
pub(crate) fn table_from_fields<C: Columnar>(
    columnar: &C,
    stream: &Stream,
    fields: PacketFields,
    data_offsets: DeviceBuffer<u32>,
    data: DeviceBuffer<u8>,
) -> Result<C::Batch> {
    let src_mac = columnar.integers_to_mac(stream, &fields.src_mac)?;
    let dst_mac = columnar.integers_to_mac(stream, &fields.dst_mac)?;
    let src_ip = columnar.integers_to_ipv4(stream, &fields.src_ip)?;
    let dst_ip = columnar.integers_to_ipv4(stream, &fields.dst_ip)?;

    let columns = vec![
        columnar.make_column(fields.timestamp)?,
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        columnar.make_column(fields.src_port)?,
        columnar.make_column(fields.dst_port)?,
        columnar.make_column(fields.packet_size)?,
        columnar.make_column(fields.tcp_flags)?,
        columnar.make_column(fields.ether_type)?,
        columnar.make_column(fields.next_proto_id)?,
        columnar.make_strings(data_offsets, data)?,
    ];
    stream.synchronize()?;
    columnar.make_table(BATCH_COLUMNS.into_iter().zip(columns).collect())
}

/// Unpacks an accumulated buffer and builds its table. The buffer is
/// consumed; its payload becomes the `data` column.
pub(crate) fn table_from_packet_data<C: Columnar>(
    columnar: &C,
    stream: &Stream,
    buffer: PacketDataBuffer,
) -> Result<C::Batch> {
    let fields = unpack_headers(stream, &buffer)?;
    let offsets = sizes_to_offsets(stream, buffer.payload_sizes())?;
    let payload = buffer.into_payload();
    table_from_fields(columnar, stream, fields, offsets, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnar::DeviceTables;
    use crate::gpu::Gpu;
    use crate::packet::HeaderRecord;

    #[test]
    fn twelve_named_columns() {
        let stream = Gpu::new("ca:00.0".parse().unwrap(), 1 << 20).create_stream();
        let a = HeaderRecord {
            timestamp: 1,
            src_mac: 0x0200_0000_0001,
            dst_mac: 0x0200_0000_0002,
            src_ip: 0x0a00_0005,
            dst_ip: 0x0a00_0001,
            src_port: 40000,
            dst_port: 5201,
            ether_type: 0x0800,
            tcp_flags: 0x18,
            next_proto_id: 6,
        };
        let b = HeaderRecord {
            timestamp: 2,
            ..a
        };
        let buffer = PacketDataBuffer::from_packets(&stream, &[(a, &b"abc"[..]), (b, &b"de"[..])]).unwrap();
        let table = table_from_packet_data(&DeviceTables, &stream, buffer).unwrap();

        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.column_names(), &BATCH_COLUMNS);
        let col = |name: &str| table.column(name).unwrap();
        assert_eq!(col("timestamp").values::<u64>(), Some(vec![1, 2]));
        assert_eq!(col("src_ip").strings_to_host().unwrap(), vec!["10.0.0.5"; 2]);
        assert_eq!(
            col("dst_mac").strings_to_host().unwrap()[0].to_ascii_lowercase(),
            "02:00:00:00:00:02"
        );
        assert_eq!(col("packet_size").values::<u32>(), Some(vec![3, 2]));
        assert_eq!(col("tcp_flags").values::<u8>(), Some(vec![0x18, 0x18]));
        assert_eq!(col("ether_type").values::<u16>(), Some(vec![0x0800; 2]));
        assert_eq!(col("data").bytes(0), Some(b"abc".to_vec()));
        assert_eq!(col("data").bytes(1), Some(b"de".to_vec()));
    }
}
