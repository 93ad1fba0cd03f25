//! Row-oriented (Avro) payload decoding.
//!
//! A payload is a concatenation of binary-encoded datums written with the
//! session's writer schema; there is no container header or sync marker.

use std::sync::Arc;

use apache_avro::schema::Schema as AvroSchema;
use apache_avro::types::Value;
use apache_avro::{from_avro_datum, Decimal};
use arrow::datatypes::{i256, DataType, FieldRef, Fields, SchemaRef, TimeUnit};
use bqlink_core::{ConnectorError, Result};
use bytes::Bytes;
use chrono::NaiveDateTime;
use datafusion::common::scalar::ScalarStructBuilder;
use datafusion::scalar::ScalarValue;

use super::EngineRow;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Converts one Avro value into a scalar of a fixed engine type.
///
/// Chosen once per column from the target type; nested lists and records
/// carry their own child converters.
#[derive(Debug, Clone)]
enum ValueConverter {
    Boolean,
    Int64,
    Float64,
    Decimal128(u8, i8),
    Decimal256(u8, i8),
    Utf8,
    Binary,
    Date32,
    Time64,
    Timestamp(Option<Arc<str>>),
    List {
        item: FieldRef,
        element: Box<ValueConverter>,
    },
    Struct {
        fields: Fields,
        children: Vec<ValueConverter>,
    },
}

impl ValueConverter {
    fn for_type(data_type: &DataType) -> Result<Self> {
        let converter = match data_type {
            DataType::Boolean => ValueConverter::Boolean,
            DataType::Int64 => ValueConverter::Int64,
            DataType::Float64 => ValueConverter::Float64,
            DataType::Decimal128(p, s) => ValueConverter::Decimal128(*p, *s),
            DataType::Decimal256(p, s) => ValueConverter::Decimal256(*p, *s),
            DataType::Utf8 => ValueConverter::Utf8,
            DataType::Binary => ValueConverter::Binary,
            DataType::Date32 => ValueConverter::Date32,
            DataType::Time64(TimeUnit::Microsecond) => ValueConverter::Time64,
            DataType::Timestamp(TimeUnit::Microsecond, tz) => ValueConverter::Timestamp(tz.clone()),
            DataType::List(item) => ValueConverter::List {
                item: Arc::clone(item),
                element: Box::new(ValueConverter::for_type(item.data_type())?),
            },
            DataType::Struct(fields) => ValueConverter::Struct {
                fields: fields.clone(),
                children: fields
                    .iter()
                    .map(|f| ValueConverter::for_type(f.data_type()))
                    .collect::<Result<Vec<_>>>()?,
            },
            other => {
                return Err(ConnectorError::TypeMapping(format!(
                    "no row converter for engine type {}",
                    other
                )))
            }
        };
        Ok(converter)
    }

    fn data_type(&self) -> DataType {
        match self {
            ValueConverter::Boolean => DataType::Boolean,
            ValueConverter::Int64 => DataType::Int64,
            ValueConverter::Float64 => DataType::Float64,
            ValueConverter::Decimal128(p, s) => DataType::Decimal128(*p, *s),
            ValueConverter::Decimal256(p, s) => DataType::Decimal256(*p, *s),
            ValueConverter::Utf8 => DataType::Utf8,
            ValueConverter::Binary => DataType::Binary,
            ValueConverter::Date32 => DataType::Date32,
            ValueConverter::Time64 => DataType::Time64(TimeUnit::Microsecond),
            ValueConverter::Timestamp(tz) => DataType::Timestamp(TimeUnit::Microsecond, tz.clone()),
            ValueConverter::List { item, .. } => DataType::List(Arc::clone(item)),
            ValueConverter::Struct { fields, .. } => DataType::Struct(fields.clone()),
        }
    }

    fn null(&self) -> Result<ScalarValue> {
        match self {
            ValueConverter::Struct { fields, .. } => Ok(ScalarStructBuilder::new_null(fields.clone())),
            other => Ok(ScalarValue::try_from(&other.data_type())?),
        }
    }

    fn convert(&self, value: &Value) -> Result<ScalarValue> {
        let value = match value {
            Value::Union(_, inner) => inner.as_ref(),
            v => v,
        };
        if matches!(value, Value::Null) {
            return self.null();
        }

        let scalar = match (self, value) {
            (ValueConverter::Boolean, Value::Boolean(b)) => ScalarValue::Boolean(Some(*b)),

            (ValueConverter::Int64, Value::Long(v)) => ScalarValue::Int64(Some(*v)),
            (ValueConverter::Int64, Value::Int(v)) => ScalarValue::Int64(Some(i64::from(*v))),

            (ValueConverter::Float64, Value::Double(v)) => ScalarValue::Float64(Some(*v)),
            (ValueConverter::Float64, Value::Float(v)) => ScalarValue::Float64(Some(f64::from(*v))),

            (ValueConverter::Decimal128(p, s), v) => {
                let bytes = decimal_bytes(v)?;
                ScalarValue::Decimal128(Some(be_bytes_to_i128(&bytes)?), *p, *s)
            }
            (ValueConverter::Decimal256(p, s), v) => {
                let bytes = decimal_bytes(v)?;
                ScalarValue::Decimal256(Some(be_bytes_to_i256(&bytes)?), *p, *s)
            }

            (ValueConverter::Utf8, Value::String(s)) => ScalarValue::Utf8(Some(s.clone())),
            (ValueConverter::Utf8, Value::Enum(_, s)) => ScalarValue::Utf8(Some(s.clone())),
            (ValueConverter::Utf8, Value::Uuid(u)) => ScalarValue::Utf8(Some(u.to_string())),

            (ValueConverter::Binary, Value::Bytes(b)) => ScalarValue::Binary(Some(b.clone())),
            (ValueConverter::Binary, Value::Fixed(_, b)) => ScalarValue::Binary(Some(b.clone())),

            (ValueConverter::Date32, Value::Date(d)) => ScalarValue::Date32(Some(*d)),
            (ValueConverter::Date32, Value::Int(d)) => ScalarValue::Date32(Some(*d)),

            (ValueConverter::Time64, Value::TimeMicros(t)) => ScalarValue::Time64Microsecond(Some(*t)),
            (ValueConverter::Time64, Value::TimeMillis(t)) => {
                ScalarValue::Time64Microsecond(Some(i64::from(*t) * 1_000))
            }
            (ValueConverter::Time64, Value::Long(t)) => ScalarValue::Time64Microsecond(Some(*t)),

            (ValueConverter::Timestamp(tz), v) => {
                ScalarValue::TimestampMicrosecond(Some(timestamp_micros(v)?), tz.clone())
            }

            (ValueConverter::List { item, element }, Value::Array(items)) => {
                let values = items
                    .iter()
                    .map(|v| element.convert(v))
                    .collect::<Result<Vec<_>>>()?;
                ScalarValue::List(ScalarValue::new_list(
                    &values,
                    item.data_type(),
                    item.is_nullable(),
                ))
            }

            (ValueConverter::Struct { fields, children }, Value::Record(record)) => {
                let mut builder = ScalarStructBuilder::new();
                for (field, child) in fields.iter().zip(children) {
                    let scalar = match record.iter().find(|(name, _)| name == field.name()) {
                        Some((_, v)) => child.convert(v)?,
                        None => child.null()?,
                    };
                    builder = builder.with_scalar(Arc::clone(field), scalar);
                }
                builder.build()?
            }

            (converter, v) => {
                return Err(ConnectorError::Decode(format!(
                    "cannot convert Avro value {:?} to {}",
                    v,
                    converter.data_type()
                )))
            }
        };
        Ok(scalar)
    }
}

fn decimal_bytes(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Decimal(d) => decimal_to_vec(d),
        Value::Bytes(b) | Value::Fixed(_, b) => Ok(b.clone()),
        other => Err(ConnectorError::Decode(format!(
            "expected decimal bytes, found {:?}",
            other
        ))),
    }
}

fn decimal_to_vec(d: &Decimal) -> Result<Vec<u8>> {
    Vec::<u8>::try_from(d).map_err(|e| ConnectorError::Decode(e.to_string()))
}

/// Big-endian two's complement to i128, sign extending short inputs.
fn be_bytes_to_i128(bytes: &[u8]) -> Result<i128> {
    if bytes.len() > 16 {
        return Err(ConnectorError::Decode(format!(
            "decimal of {} bytes does not fit in 128 bits",
            bytes.len()
        )));
    }
    let fill = if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        0xff
    } else {
        0x00
    };
    let mut buf = [fill; 16];
    buf[16 - bytes.len()..].copy_from_slice(bytes);
    Ok(i128::from_be_bytes(buf))
}

fn be_bytes_to_i256(bytes: &[u8]) -> Result<i256> {
    if bytes.len() > 32 {
        return Err(ConnectorError::Decode(format!(
            "decimal of {} bytes does not fit in 256 bits",
            bytes.len()
        )));
    }
    let fill = if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        0xff
    } else {
        0x00
    };
    let mut buf = [fill; 32];
    buf[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(i256::from_be_bytes(buf))
}

fn timestamp_micros(value: &Value) -> Result<i64> {
    match value {
        Value::TimestampMicros(v) | Value::LocalTimestampMicros(v) | Value::Long(v) => Ok(*v),
        Value::TimestampMillis(v) | Value::LocalTimestampMillis(v) => Ok(v * 1_000),
        // DATETIME columns arrive as civil time strings.
        Value::String(s) => NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
            .map(|dt| dt.and_utc().timestamp_micros())
            .map_err(|e| ConnectorError::Decode(format!("invalid DATETIME '{}': {}", s, e))),
        other => Err(ConnectorError::Decode(format!(
            "expected a timestamp, found {:?}",
            other
        ))),
    }
}

// ===========================================================================
// Row converter
// ===========================================================================

/// Reusable converter from Avro records to engine rows.
#[derive(Debug, Clone)]
pub struct AvroRowConverter {
    writer_schema: Arc<AvroSchema>,
    /// Per output column: position in the writer record and its converter.
    columns: Arc<Vec<(usize, ValueConverter)>>,
}

impl AvroRowConverter {
    pub fn new(writer_schema_json: &str, output_schema: SchemaRef) -> Result<Self> {
        let writer_schema = AvroSchema::parse_str(writer_schema_json)
            .map_err(|e| ConnectorError::Decode(format!("invalid Avro schema: {}", e)))?;
        let lookup = match &writer_schema {
            AvroSchema::Record(record) => &record.lookup,
            other => {
                return Err(ConnectorError::Decode(format!(
                    "Avro session schema must be a record, found {:?}",
                    other
                )))
            }
        };

        let columns = output_schema
            .fields()
            .iter()
            .map(|field| {
                let position = lookup.get(field.name()).copied().ok_or_else(|| {
                    ConnectorError::Decode(format!(
                        "column '{}' is not present in the session schema",
                        field.name()
                    ))
                })?;
                Ok((position, ValueConverter::for_type(field.data_type())?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            writer_schema: Arc::new(writer_schema),
            columns: Arc::new(columns),
        })
    }

    /// Convert one decoded datum into an engine row.
    pub fn convert(&self, datum: &Value) -> Result<EngineRow> {
        let Value::Record(fields) = datum else {
            return Err(ConnectorError::Decode(format!(
                "expected an Avro record, found {:?}",
                datum
            )));
        };
        self.columns
            .iter()
            .map(|(position, converter)| {
                let (_, value) = fields.get(*position).ok_or_else(|| {
                    ConnectorError::Decode(format!(
                        "record has {} fields, expected at least {}",
                        fields.len(),
                        position + 1
                    ))
                })?;
                converter.convert(value)
            })
            .collect()
    }

    pub fn rows(&self, payload: Bytes) -> AvroRows {
        AvroRows {
            converter: self.clone(),
            payload,
            position: 0,
        }
    }
}

/// Datums of one payload, decoded lazily.
pub struct AvroRows {
    converter: AvroRowConverter,
    payload: Bytes,
    position: usize,
}

impl Iterator for AvroRows {
    type Item = Result<EngineRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.payload.len() {
            return None;
        }
        let mut remaining = &self.payload[self.position..];
        let before = remaining.len();
        match from_avro_datum(&self.converter.writer_schema, &mut remaining, None) {
            Ok(datum) => {
                self.position += before - remaining.len();
                Some(self.converter.convert(&datum))
            }
            Err(e) => {
                self.position = self.payload.len();
                Some(Err(ConnectorError::Decode(format!(
                    "invalid Avro datum: {}",
                    e
                ))))
            }
        }
    }
}
