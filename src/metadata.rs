//! The tabular metadata a publisher offers to its subscribers.
//!
//! The data set is deliberately schema-free: named tables of rows addressed
//! by case-insensitive column name. Subscription filter expressions are
//! resolved against it through the [`FilterParser`] seam, so embedders can
//! plug in a full expression engine while the transport core only depends on
//! "expression in, signal IDs out".

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::transport::constants::OperationalEncoding;
use crate::util::buf::{put_guid, put_string, try_get_guid, try_get_string};

/// The table subscription expressions conventionally select from.
pub const ACTIVE_MEASUREMENTS: &str = "ActiveMeasurements";

#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Str(String),
    Guid(Uuid),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl DataValue {
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            DataValue::Guid(guid) => Some(*guid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn ser(&self, buf: &mut BytesMut, encoding: OperationalEncoding) {
        match self {
            DataValue::Null => buf.put_u8(0),
            DataValue::Str(s) => {
                buf.put_u8(1);
                put_string(buf, s, encoding);
            }
            DataValue::Guid(guid) => {
                buf.put_u8(2);
                put_guid(buf, *guid);
            }
            DataValue::Int(i) => {
                buf.put_u8(3);
                buf.put_i64(*i);
            }
            DataValue::Float(f) => {
                buf.put_u8(4);
                buf.put_u64(f.to_bits());
            }
            DataValue::Bool(b) => {
                buf.put_u8(5);
                buf.put_u8(*b as u8);
            }
        }
    }

    fn try_deser(buf: &mut impl Buf, encoding: OperationalEncoding) -> anyhow::Result<DataValue> {
        Ok(match buf.try_get_u8()? {
            0 => DataValue::Null,
            1 => DataValue::Str(try_get_string(buf, encoding)?),
            2 => DataValue::Guid(try_get_guid(buf)?),
            3 => DataValue::Int(buf.try_get_u64()? as i64),
            4 => DataValue::Float(f64::from_bits(buf.try_get_u64()?)),
            5 => DataValue::Bool(buf.try_get_u8()? != 0),
            tag => bail!("unknown metadata value tag {}", tag),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataRow {
    pub values: Vec<DataValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<DataRow>,
}

impl DataTable {
    pub fn new(name: &str, columns: &[&str]) -> DataTable {
        DataTable {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn value<'a>(&self, row: &'a DataRow, column: &str) -> Option<&'a DataValue> {
        self.column_index(column).and_then(move |i| row.values.get(i))
    }

    pub fn add_row(&mut self, values: Vec<DataValue>) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(DataRow { values });
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    pub tables: Vec<DataTable>,
}

impl DataSet {
    pub fn new() -> DataSet {
        Default::default()
    }

    pub fn table(&self, name: &str) -> Option<&DataTable> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn add_table(&mut self, table: DataTable) {
        self.tables.push(table);
    }

    /// Convenience constructor for the common measurement inventory shape:
    ///  one `ActiveMeasurements` table with signal ID, measurement key and
    ///  point tag per row.
    pub fn with_measurements(measurements: &[(Uuid, &str, u64, &str)]) -> DataSet {
        let mut table = DataTable::new(ACTIVE_MEASUREMENTS, &["SignalID", "Source", "ID", "PointTag"]);
        for &(signal_id, source, id, tag) in measurements {
            table.add_row(vec![
                DataValue::Guid(signal_id),
                DataValue::Str(source.to_string()),
                DataValue::Int(id as i64),
                DataValue::Str(tag.to_string()),
            ]);
        }
        let mut dataset = DataSet::new();
        dataset.add_table(table);
        dataset
    }

    pub fn ser(&self, encoding: OperationalEncoding) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.tables.len() as u32);
        for table in &self.tables {
            put_string(&mut buf, &table.name, encoding);
            buf.put_u32(table.columns.len() as u32);
            for column in &table.columns {
                put_string(&mut buf, column, encoding);
            }
            buf.put_u32(table.rows.len() as u32);
            for row in &table.rows {
                for value in &row.values {
                    value.ser(&mut buf, encoding);
                }
            }
        }
        buf.freeze()
    }

    pub fn try_deser(mut buf: impl Buf, encoding: OperationalEncoding) -> anyhow::Result<DataSet> {
        let table_count = buf.try_get_u32()?;
        let mut dataset = DataSet::new();

        for _ in 0..table_count {
            let name = try_get_string(&mut buf, encoding)?;
            let column_count = buf.try_get_u32()? as usize;
            let mut columns = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                columns.push(try_get_string(&mut buf, encoding)?);
            }

            let row_count = buf.try_get_u32()?;
            let mut rows = Vec::new();
            for _ in 0..row_count {
                let mut values = Vec::with_capacity(column_count);
                for _ in 0..column_count {
                    values.push(DataValue::try_deser(&mut buf, encoding)?);
                }
                rows.push(DataRow { values });
            }

            dataset.add_table(DataTable { name, columns, rows });
        }
        Ok(dataset)
    }

    /// Content digest used to detect configuration changes across
    ///  `define_metadata` calls.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.ser(OperationalEncoding::Utf8)).into()
    }

    /// Maps every signal ID in the data set to its human-readable measurement
    ///  key (source string plus numeric ID), for signal index cache records.
    pub fn measurement_keys(&self) -> FxHashMap<Uuid, (String, u64)> {
        let mut keys = FxHashMap::default();

        for table in &self.tables {
            let Some(signal_column) = table.column_index("SignalID") else {
                continue;
            };
            let source_column = table.column_index("Source");
            let id_column = table.column_index("ID");

            for row in &table.rows {
                let Some(signal_id) = row.values.get(signal_column).and_then(DataValue::as_guid) else {
                    continue;
                };
                let source = source_column
                    .and_then(|i| row.values.get(i))
                    .and_then(DataValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let id = match id_column.and_then(|i| row.values.get(i)) {
                    Some(DataValue::Int(id)) => *id as u64,
                    _ => 0,
                };
                keys.insert(signal_id, (source, id));
            }
        }
        keys
    }
}

/// Resolves a subscription's filter expression to the set of signals it
///  selects. The expression language itself is outside the transport core;
///  this seam is where a full engine plugs in.
pub trait FilterParser: Send + Sync {
    fn resolve(&self, expression: &str, dataset: &DataSet) -> anyhow::Result<Vec<Uuid>>;
}

/// Covers the two expression shapes the transport itself needs: a
///  `FILTER <table> WHERE True` match-all and plain semicolon-separated
///  signal ID lists.
pub struct DefaultFilterParser;

impl FilterParser for DefaultFilterParser {
    fn resolve(&self, expression: &str, dataset: &DataSet) -> anyhow::Result<Vec<Uuid>> {
        let expression = expression.trim();
        if expression.is_empty() {
            bail!("empty filter expression");
        }

        if let Some(rest) = strip_prefix_ignore_case(expression, "FILTER ") {
            let (table_name, condition) = rest
                .split_once(" WHERE ")
                .or_else(|| rest.split_once(" where "))
                .ok_or_else(|| anyhow!("filter expression is missing a WHERE clause: {}", expression))?;

            if !condition.trim().eq_ignore_ascii_case("true") {
                bail!("unsupported filter condition: {}", condition.trim());
            }

            let table = dataset
                .table(table_name.trim())
                .ok_or_else(|| anyhow!("unknown table in filter expression: {}", table_name.trim()))?;
            let signal_column = table
                .column_index("SignalID")
                .ok_or_else(|| anyhow!("table {} has no SignalID column", table.name))?;

            return Ok(table.rows.iter()
                .filter_map(|row| row.values.get(signal_column).and_then(DataValue::as_guid))
                .collect());
        }

        // otherwise: a direct list of signal IDs
        expression
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Uuid::parse_str(s).map_err(|e| anyhow!("invalid signal ID {:?} in filter expression: {}", s, e)))
            .collect()
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    }
    else {
        None
    }
}
