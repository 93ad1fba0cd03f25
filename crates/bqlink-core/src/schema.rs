//! Warehouse to engine schema conversion.
//!
//! Every supported warehouse column type maps to exactly one Arrow type:
//!
//! | Warehouse                 | Engine                      |
//! |---------------------------|-----------------------------|
//! | INTEGER                   | Int64                       |
//! | FLOAT                     | Float64                     |
//! | NUMERIC(P, S)             | Decimal128(P or 38, S or 9) |
//! | BIGNUMERIC(P, S)          | Decimal256(P or 76, S or 38)|
//! | BOOLEAN                   | Boolean                     |
//! | STRING, GEOGRAPHY, JSON   | Utf8                        |
//! | BYTES                     | Binary                      |
//! | DATE                      | Date32                      |
//! | TIME                      | Time64(µs)                  |
//! | DATETIME                  | Timestamp(µs)               |
//! | TIMESTAMP                 | Timestamp(µs, UTC)          |
//! | RECORD                    | Struct                      |
//!
//! A REPEATED column becomes a nullable `List` whose element is non-nullable.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, FieldRef, Fields, Schema, SchemaRef, TimeUnit};

use crate::error::{ConnectorError, Result};
use crate::model::{FieldMode, FieldSchema, FieldType, TableSchema};

pub const NUMERIC_DEFAULT_PRECISION: u8 = 38;
pub const NUMERIC_DEFAULT_SCALE: i8 = 9;
pub const BIGNUMERIC_DEFAULT_PRECISION: u8 = 76;
pub const BIGNUMERIC_DEFAULT_SCALE: i8 = 38;

/// Name of the element field inside list columns.
pub const LIST_ITEM: &str = "item";

pub const UTC: &str = "UTC";

/// Engine type of a single warehouse column, honouring its mode.
pub fn to_engine_type(field: &FieldSchema) -> Result<DataType> {
    let element = element_type(field)?;
    if field.mode == FieldMode::Repeated {
        Ok(DataType::List(Arc::new(Field::new(LIST_ITEM, element, false))))
    } else {
        Ok(element)
    }
}

fn element_type(field: &FieldSchema) -> Result<DataType> {
    let dt = match &field.field_type {
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Numeric => DataType::Decimal128(
            precision(field, NUMERIC_DEFAULT_PRECISION)?,
            scale(field, NUMERIC_DEFAULT_SCALE)?,
        ),
        FieldType::BigNumeric => DataType::Decimal256(
            precision(field, BIGNUMERIC_DEFAULT_PRECISION)?,
            scale(field, BIGNUMERIC_DEFAULT_SCALE)?,
        ),
        FieldType::Boolean => DataType::Boolean,
        FieldType::String | FieldType::Geography | FieldType::Json => DataType::Utf8,
        FieldType::Bytes => DataType::Binary,
        FieldType::Date => DataType::Date32,
        FieldType::Time => DataType::Time64(TimeUnit::Microsecond),
        FieldType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
        FieldType::Record => {
            if field.fields.is_empty() {
                return Err(ConnectorError::TypeMapping(format!(
                    "RECORD column '{}' has no sub-fields",
                    field.name
                )));
            }
            let children = field
                .fields
                .iter()
                .map(to_engine_field)
                .collect::<Result<Vec<_>>>()?;
            DataType::Struct(Fields::from(children))
        }
        FieldType::Interval | FieldType::Range | FieldType::Other(_) => {
            return Err(ConnectorError::TypeMapping(format!(
                "column '{}' has type {} which has no engine counterpart",
                field.name, field.field_type
            )))
        }
    };
    Ok(dt)
}

fn precision(field: &FieldSchema, default: u8) -> Result<u8> {
    match field.precision {
        None => Ok(default),
        Some(p) => u8::try_from(p)
            .ok()
            .filter(|p| *p > 0 && *p <= BIGNUMERIC_DEFAULT_PRECISION)
            .ok_or_else(|| {
                ConnectorError::TypeMapping(format!(
                    "column '{}' has unsupported precision {}",
                    field.name, p
                ))
            }),
    }
}

fn scale(field: &FieldSchema, default: i8) -> Result<i8> {
    match field.scale {
        None => Ok(default),
        Some(s) => i8::try_from(s).map_err(|_| {
            ConnectorError::TypeMapping(format!(
                "column '{}' has unsupported scale {}",
                field.name, s
            ))
        }),
    }
}

/// Engine field of a warehouse column. REQUIRED columns are non-nullable.
pub fn to_engine_field(field: &FieldSchema) -> Result<Field> {
    let nullable = field.mode != FieldMode::Required;
    Ok(Field::new(&field.name, to_engine_type(field)?, nullable))
}

pub fn to_engine_schema(schema: &TableSchema) -> Result<SchemaRef> {
    let fields = schema
        .fields
        .iter()
        .map(to_engine_field)
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

/// Engine type for a column of the columnar wire format.
///
/// Narrow integer and float widths widen to 64 bits so that rows decoded from
/// either wire format carry identical scalar types.
pub fn arrow_field_to_engine(field: &Field) -> Result<DataType> {
    let dt = match field.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => DataType::Int64,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => DataType::Float64,
        DataType::Boolean => DataType::Boolean,
        DataType::Decimal128(p, s) => DataType::Decimal128(*p, *s),
        DataType::Decimal256(p, s) => DataType::Decimal256(*p, *s),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => DataType::Utf8,
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView => DataType::Binary,
        DataType::FixedSizeBinary(_) => DataType::Binary,
        DataType::Date32 | DataType::Date64 => DataType::Date32,
        DataType::Time32(_) | DataType::Time64(_) => DataType::Time64(TimeUnit::Microsecond),
        DataType::Timestamp(_, tz) => DataType::Timestamp(TimeUnit::Microsecond, tz.clone()),
        DataType::List(child) | DataType::LargeList(child) => {
            DataType::List(Arc::new(arrow_child_to_engine(child)?))
        }
        DataType::Struct(children) => DataType::Struct(
            children
                .iter()
                .map(arrow_child_to_engine)
                .collect::<Result<Vec<_>>>()?
                .into(),
        ),
        other => {
            return Err(ConnectorError::TypeMapping(format!(
                "columnar field '{}' has unsupported type {}",
                field.name(),
                other
            )))
        }
    };
    Ok(dt)
}

fn arrow_child_to_engine(child: &FieldRef) -> Result<Field> {
    Ok(Field::new(
        child.name(),
        arrow_field_to_engine(child)?,
        child.is_nullable(),
    ))
}

/// Restrict `schema` to `columns`, in that order.
pub fn project_schema(schema: &Schema, columns: &[String]) -> Result<SchemaRef> {
    let fields = columns
        .iter()
        .map(|name| {
            schema
                .field_with_name(name)
                .cloned()
                .map_err(|_| ConnectorError::Configuration(format!("unknown column '{}'", name)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}
