//! Device-resident columns and tables.

use std::net::Ipv4Addr;

use eui48::{MacAddress, MacAddressFormat};

use crate::api::Columnar;
use crate::errors::{Error, Result};
use crate::gpu::{DeviceBuffer, DeviceValue, Stream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Utf8,
}

#[derive(Debug)]
pub enum ColumnData {
    UInt8(DeviceBuffer<u8>),
    UInt16(DeviceBuffer<u16>),
    UInt32(DeviceBuffer<u32>),
    UInt64(DeviceBuffer<u64>),
    Utf8 {
        offsets: DeviceBuffer<u32>,
        chars: DeviceBuffer<u8>,
    },
}

/// Element types a fixed-width column can hold.
pub trait ColumnValue: DeviceValue {
    const TYPE: DataType;

    fn wrap(values: DeviceBuffer<Self>) -> ColumnData;
    fn unwrap(data: &ColumnData) -> Option<&DeviceBuffer<Self>>;
}

macro_rules! column_value {
    ($t:ty, $variant:ident) => {
        impl ColumnValue for $t {
            const TYPE: DataType = DataType::$variant;

            fn wrap(values: DeviceBuffer<Self>) -> ColumnData {
                ColumnData::$variant(values)
            }

            fn unwrap(data: &ColumnData) -> Option<&DeviceBuffer<Self>> {
                match data {
                    ColumnData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

column_value!(u8, UInt8);
column_value!(u16, UInt16);
column_value!(u32, UInt32);
column_value!(u64, UInt64);

#[derive(Debug)]
pub struct Column {
    data: ColumnData,
}

impl Column {
    pub fn from_device<T: ColumnValue>(values: DeviceBuffer<T>) -> Self {
        Self {
            data: T::wrap(values),
        }
    }

    /// String column: row `i` is `chars[offsets[i]..offsets[i + 1]]`.
    pub fn strings(offsets: DeviceBuffer<u32>, chars: DeviceBuffer<u8>) -> Result<Self> {
        let valid = !offsets.is_empty()
            && offsets.device().windows(2).all(|w| w[0] <= w[1])
            && offsets.device().last().is_some_and(|end| *end as usize == chars.len());
        if !valid {
            return Err(Error::InvalidConfig {
                field: "string column",
                reason: format!("{} offsets do not span {} bytes", offsets.len(), chars.len()),
            });
        }
        Ok(Self {
            data: ColumnData::Utf8 { offsets, chars },
        })
    }

    pub fn data_type(&self) -> DataType {
        match &self.data {
            ColumnData::UInt8(_) => DataType::UInt8,
            ColumnData::UInt16(_) => DataType::UInt16,
            ColumnData::UInt32(_) => DataType::UInt32,
            ColumnData::UInt64(_) => DataType::UInt64,
            ColumnData::Utf8 { .. } => DataType::Utf8,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Utf8 { offsets, .. } => offsets.len() - 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Host copy of a fixed-width column, `None` on a type mismatch.
    pub fn values<T: ColumnValue>(&self) -> Option<Vec<T>> {
        T::unwrap(&self.data).map(DeviceBuffer::to_host)
    }

    /// Host copy of row `row` of a string column.
    pub fn bytes(&self, row: usize) -> Option<Vec<u8>> {
        let ColumnData::Utf8 { offsets, chars } = &self.data else {
            return None;
        };
        let start = offsets.element(row)? as usize;
        let end = offsets.element(row + 1)? as usize;
        Some(chars.device()[start..end].to_vec())
    }

    /// Host copy of a string column, invalid UTF-8 replaced.
    pub fn strings_to_host(&self) -> Option<Vec<String>> {
        (0..self.len())
            .map(|row| self.bytes(row).map(|b| String::from_utf8_lossy(&b).into_owned()))
            .collect()
    }
}

/// Named columns of equal length.
#[derive(Debug)]
pub struct Table {
    names: Vec<&'static str>,
    columns: Vec<Column>,
    num_rows: usize,
}

impl Table {
    pub fn new(columns: Vec<(&'static str, Column)>) -> Result<Self> {
        let num_rows = columns.first().map_or(0, |(_, c)| c.len());
        if let Some((name, col)) = columns.iter().find(|(_, c)| c.len() != num_rows) {
            return Err(Error::InvalidConfig {
                field: "table",
                reason: format!("column {name} has {} rows, expected {num_rows}", col.len()),
            });
        }
        let (names, columns) = columns.into_iter().unzip();
        Ok(Self {
            names,
            columns,
            num_rows,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|i| &self.columns[i])
    }
}

/// Builds fixed-width string columns from integers.
fn format_column<T: DeviceValue>(
    stream: &Stream,
    kernel: &'static str,
    values: &DeviceBuffer<T>,
    width: usize,
    format: impl Fn(T) -> String,
) -> Result<Column> {
    let mut offsets = DeviceBuffer::<u32>::zeroed(stream, values.len() + 1)?;
    let mut chars = DeviceBuffer::<u8>::zeroed(stream, values.len() * width)?;
    let written = stream.launch(kernel, || {
        let mut at = 0usize;
        for (i, v) in values.device().iter().enumerate() {
            offsets.device_mut()[i] = at as u32;
            let s = format(*v);
            let end = (at + s.len()).min(chars.len());
            chars.device_mut()[at..end].copy_from_slice(&s.as_bytes()[..end - at]);
            at = end;
        }
        offsets.device_mut()[values.len()] = at as u32;
        at
    })?;
    if written < chars.len() {
        // Variable-width output; shrink to the bytes actually written.
        let mut exact = DeviceBuffer::<u8>::zeroed(stream, written)?;
        let src = &chars.device()[..written];
        exact.device_mut().copy_from_slice(src);
        chars = exact;
    }
    Column::strings(offsets, chars)
}

/// [`Columnar`] backed by this crate's device [`Table`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceTables;

impl Columnar for DeviceTables {
    type Batch = Table;

    fn make_column<T: ColumnValue>(&self, values: DeviceBuffer<T>) -> Result<Column> {
        Ok(Column::from_device(values))
    }

    fn make_strings(&self, offsets: DeviceBuffer<u32>, chars: DeviceBuffer<u8>) -> Result<Column> {
        Column::strings(offsets, chars)
    }

    fn integers_to_mac(&self, stream: &Stream, macs: &DeviceBuffer<u64>) -> Result<Column> {
        format_column(stream, "integers_to_mac", macs, 17, |v| {
            let b = v.to_be_bytes();
            MacAddress::new([b[2], b[3], b[4], b[5], b[6], b[7]]).to_string(MacAddressFormat::HexString)
        })
    }

    fn integers_to_ipv4(&self, stream: &Stream, ips: &DeviceBuffer<u32>) -> Result<Column> {
        format_column(stream, "integers_to_ipv4", ips, 15, |v| Ipv4Addr::from(v).to_string())
    }

    fn make_table(&self, columns: Vec<(&'static str, Column)>) -> Result<Table> {
        Table::new(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::Gpu;

    fn stream() -> Stream {
        Gpu::new("ca:00.0".parse().unwrap(), 1 << 20).create_stream()
    }

    #[test]
    fn macs_render_as_colon_hex() {
        let stream = stream();
        let macs = DeviceBuffer::from_host(&stream, &[0xaabb_ccdd_eeff_u64, 0x0102_0304_0506]).unwrap();
        let col = DeviceTables.integers_to_mac(&stream, &macs).unwrap();
        assert_eq!(col.data_type(), DataType::Utf8);
        let rendered: Vec<String> = col
            .strings_to_host()
            .unwrap()
            .into_iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        assert_eq!(rendered, vec!["aa:bb:cc:dd:ee:ff", "01:02:03:04:05:06"]);
    }

    #[test]
    fn ipv4_renders_dotted_quad() {
        let stream = stream();
        let ips = DeviceBuffer::from_host(&stream, &[0x0a00_0005_u32, 0xc0a8_0102, 0]).unwrap();
        let col = DeviceTables.integers_to_ipv4(&stream, &ips).unwrap();
        assert_eq!(
            col.strings_to_host().unwrap(),
            vec!["10.0.0.5", "192.168.1.2", "0.0.0.0"]
        );
    }

    #[test]
    fn table_rejects_ragged_columns() {
        let stream = stream();
        let a = Column::from_device(DeviceBuffer::from_host(&stream, &[1u16, 2]).unwrap());
        let b = Column::from_device(DeviceBuffer::from_host(&stream, &[1u8]).unwrap());
        assert!(matches!(
            DeviceTables.make_table(vec![("a", a), ("b", b)]),
            Err(Error::InvalidConfig { field: "table", .. })
        ));
    }

    #[test]
    fn table_lookup_by_name() {
        let stream = stream();
        let a = Column::from_device(DeviceBuffer::from_host(&stream, &[1u16, 2]).unwrap());
        let offsets = DeviceBuffer::from_host(&stream, &[0u32, 2, 3]).unwrap();
        let chars = DeviceBuffer::from_host(&stream, b"hey").unwrap();
        let s = Column::strings(offsets, chars).unwrap();
        let table = Table::new(vec![("port", a), ("data", s)]).unwrap();
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.column_names(), &["port", "data"]);
        assert_eq!(table.column("port").unwrap().values::<u16>(), Some(vec![1, 2]));
        assert_eq!(table.column("port").unwrap().values::<u8>(), None);
        assert_eq!(table.column("data").unwrap().bytes(1), Some(b"y".to_vec()));
        assert!(table.column("nope").is_none());
    }

    #[test]
    fn bad_offsets_are_rejected() {
        let stream = stream();
        let offsets = DeviceBuffer::from_host(&stream, &[0u32, 4]).unwrap();
        let chars = DeviceBuffer::from_host(&stream, b"abc").unwrap();
        assert!(Column::strings(offsets, chars).is_err());
    }
}
