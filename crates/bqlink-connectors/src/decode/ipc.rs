//! Columnar (Arrow IPC) payload decoding.
//!
//! The session carries a serialized IPC schema message; each payload is one
//! or more record batch messages written against it. Columns are cast once
//! to their engine type and wrapped in a [`ColumnAccessor`], after which rows
//! are read out value by value.

use std::io::{Cursor, Read};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, BooleanArray, Date32Array, Decimal128Array,
    Decimal256Array, Float64Array, Int64Array, ListArray, RecordBatch, StringArray, StructArray,
    Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Date32Type, Decimal128Type, Decimal256Type, FieldRef, Fields, Float64Type,
    Int64Type, Schema, SchemaRef, Time64MicrosecondType, TimeUnit, TimestampMicrosecondType,
};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use bqlink_core::schema::arrow_field_to_engine;
use bqlink_core::{ConnectorError, Result};
use bytes::Bytes;
use datafusion::common::scalar::ScalarStructBuilder;
use datafusion::scalar::ScalarValue;

use super::EngineRow;

// ===========================================================================
// Column accessors
// ===========================================================================

/// Typed read access to one column of a decoded batch.
#[derive(Debug)]
pub enum ColumnAccessor {
    Boolean(BooleanArray),
    Int64(Int64Array),
    Float64(Float64Array),
    Decimal128(Decimal128Array, u8, i8),
    Decimal256(Decimal256Array, u8, i8),
    Utf8(StringArray),
    Binary(BinaryArray),
    Date32(Date32Array),
    Time64(Time64MicrosecondArray),
    Timestamp(TimestampMicrosecondArray, Option<Arc<str>>),
    List {
        array: ListArray,
        item: FieldRef,
        child: Box<ColumnAccessor>,
    },
    Struct {
        array: StructArray,
        fields: Fields,
        children: Vec<ColumnAccessor>,
    },
}

impl ColumnAccessor {
    /// Wrap `array`, which must already carry an engine type.
    pub fn new(array: &ArrayRef) -> Result<Self> {
        let accessor = match array.data_type() {
            DataType::Boolean => ColumnAccessor::Boolean(array.as_boolean().clone()),
            DataType::Int64 => ColumnAccessor::Int64(array.as_primitive::<Int64Type>().clone()),
            DataType::Float64 => {
                ColumnAccessor::Float64(array.as_primitive::<Float64Type>().clone())
            }
            DataType::Decimal128(p, s) => ColumnAccessor::Decimal128(
                array.as_primitive::<Decimal128Type>().clone(),
                *p,
                *s,
            ),
            DataType::Decimal256(p, s) => ColumnAccessor::Decimal256(
                array.as_primitive::<Decimal256Type>().clone(),
                *p,
                *s,
            ),
            DataType::Utf8 => ColumnAccessor::Utf8(array.as_string::<i32>().clone()),
            DataType::Binary => ColumnAccessor::Binary(array.as_binary::<i32>().clone()),
            DataType::Date32 => ColumnAccessor::Date32(array.as_primitive::<Date32Type>().clone()),
            DataType::Time64(TimeUnit::Microsecond) => {
                ColumnAccessor::Time64(array.as_primitive::<Time64MicrosecondType>().clone())
            }
            DataType::Timestamp(TimeUnit::Microsecond, tz) => ColumnAccessor::Timestamp(
                array.as_primitive::<TimestampMicrosecondType>().clone(),
                tz.clone(),
            ),
            DataType::List(item) => {
                let list = array.as_list::<i32>().clone();
                let child = Box::new(ColumnAccessor::new(list.values())?);
                ColumnAccessor::List {
                    array: list,
                    item: Arc::clone(item),
                    child,
                }
            }
            DataType::Struct(fields) => {
                let array = array.as_struct().clone();
                let children = array
                    .columns()
                    .iter()
                    .map(ColumnAccessor::new)
                    .collect::<Result<Vec<_>>>()?;
                ColumnAccessor::Struct {
                    array,
                    fields: fields.clone(),
                    children,
                }
            }
            other => {
                return Err(ConnectorError::TypeMapping(format!(
                    "no column accessor for engine type {}",
                    other
                )))
            }
        };
        Ok(accessor)
    }

    fn array(&self) -> &dyn Array {
        match self {
            ColumnAccessor::Boolean(a) => a,
            ColumnAccessor::Int64(a) => a,
            ColumnAccessor::Float64(a) => a,
            ColumnAccessor::Decimal128(a, _, _) => a,
            ColumnAccessor::Decimal256(a, _, _) => a,
            ColumnAccessor::Utf8(a) => a,
            ColumnAccessor::Binary(a) => a,
            ColumnAccessor::Date32(a) => a,
            ColumnAccessor::Time64(a) => a,
            ColumnAccessor::Timestamp(a, _) => a,
            ColumnAccessor::List { array, .. } => array,
            ColumnAccessor::Struct { array, .. } => array,
        }
    }

    pub fn len(&self) -> usize {
        self.array().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.array().is_null(row)
    }

    pub fn data_type(&self) -> &DataType {
        self.array().data_type()
    }

    /// Value at `row`. Null slots must be screened with [`Self::is_null`];
    /// an index past the end is an error.
    pub fn get(&self, row: usize) -> Result<ScalarValue> {
        if row >= self.len() {
            return Err(ConnectorError::Decode(format!(
                "row index {} out of bounds for column of length {}",
                row,
                self.len()
            )));
        }
        let scalar = match self {
            ColumnAccessor::Boolean(a) => ScalarValue::Boolean(Some(a.value(row))),
            ColumnAccessor::Int64(a) => ScalarValue::Int64(Some(a.value(row))),
            ColumnAccessor::Float64(a) => ScalarValue::Float64(Some(a.value(row))),
            ColumnAccessor::Decimal128(a, p, s) => ScalarValue::Decimal128(Some(a.value(row)), *p, *s),
            ColumnAccessor::Decimal256(a, p, s) => ScalarValue::Decimal256(Some(a.value(row)), *p, *s),
            ColumnAccessor::Utf8(a) => ScalarValue::Utf8(Some(a.value(row).to_string())),
            ColumnAccessor::Binary(a) => ScalarValue::Binary(Some(a.value(row).to_vec())),
            ColumnAccessor::Date32(a) => ScalarValue::Date32(Some(a.value(row))),
            ColumnAccessor::Time64(a) => ScalarValue::Time64Microsecond(Some(a.value(row))),
            ColumnAccessor::Timestamp(a, tz) => {
                ScalarValue::TimestampMicrosecond(Some(a.value(row)), tz.clone())
            }
            ColumnAccessor::List { array, item, child } => {
                let offsets = array.value_offsets();
                let (start, end) = (offsets[row] as usize, offsets[row + 1] as usize);
                let values = (start..end)
                    .map(|i| child.get_or_null(i))
                    .collect::<Result<Vec<_>>>()?;
                ScalarValue::List(ScalarValue::new_list(
                    &values,
                    item.data_type(),
                    item.is_nullable(),
                ))
            }
            ColumnAccessor::Struct {
                fields, children, ..
            } => {
                let mut builder = ScalarStructBuilder::new();
                for (field, child) in fields.iter().zip(children) {
                    builder = builder.with_scalar(Arc::clone(field), child.get_or_null(row)?);
                }
                builder.build()?
            }
        };
        Ok(scalar)
    }

    /// Like [`Self::get`], returning a typed null for null slots.
    pub fn get_or_null(&self, row: usize) -> Result<ScalarValue> {
        if row < self.len() && self.is_null(row) {
            return match self {
                ColumnAccessor::Struct { fields, .. } => {
                    Ok(ScalarStructBuilder::new_null(fields.clone()))
                }
                other => Ok(ScalarValue::try_from(other.data_type())?),
            };
        }
        self.get(row)
    }
}

/// The accessors of one decoded record batch.
///
/// Dropping or closing the batch releases every column buffer, including
/// those of nested children.
#[derive(Debug)]
pub struct ColumnarBatch {
    columns: Vec<ColumnAccessor>,
    num_rows: usize,
}

impl ColumnarBatch {
    pub fn new(columns: Vec<ColumnAccessor>, num_rows: usize) -> Self {
        Self { columns, num_rows }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn column(&self, index: usize) -> Option<&ColumnAccessor> {
        self.columns.get(index)
    }

    pub fn row(&self, row: usize) -> Result<EngineRow> {
        if row >= self.num_rows {
            return Err(ConnectorError::Decode(format!(
                "row index {} out of bounds for batch of {} rows",
                row, self.num_rows
            )));
        }
        self.columns.iter().map(|c| c.get_or_null(row)).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.num_rows == 0 && self.columns.is_empty()
    }

    pub fn close(&mut self) {
        self.columns.clear();
        self.num_rows = 0;
    }
}

impl Drop for ColumnarBatch {
    fn drop(&mut self) {
        self.close();
    }
}

// ===========================================================================
// Decoder
// ===========================================================================

/// Decodes record batch messages against the session's IPC schema.
#[derive(Debug, Clone)]
pub struct ArrowBatchDecoder {
    schema_message: Bytes,
    /// Per output column: position in the wire schema and engine type.
    plan: Arc<Vec<(usize, DataType)>>,
}

impl ArrowBatchDecoder {
    pub fn new(schema_message: Bytes, output_schema: SchemaRef) -> Result<Self> {
        let wire_schema = read_schema(&schema_message)?;
        let plan = output_schema
            .fields()
            .iter()
            .map(|field| {
                let (index, wire_field) = wire_schema.column_with_name(field.name()).ok_or_else(|| {
                    ConnectorError::Decode(format!(
                        "column '{}' is not present in the session schema",
                        field.name()
                    ))
                })?;
                // The wire type only decides support; the target type wins.
                arrow_field_to_engine(wire_field)?;
                Ok((index, field.data_type().clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_message,
            plan: Arc::new(plan),
        })
    }

    fn wrap(&self, batch: &RecordBatch) -> Result<ColumnarBatch> {
        let columns = self
            .plan
            .iter()
            .map(|(index, target)| {
                let column = batch.column(*index);
                if column.data_type() == target {
                    ColumnAccessor::new(column)
                } else {
                    ColumnAccessor::new(&cast(column, target)?)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ColumnarBatch::new(columns, batch.num_rows()))
    }

    /// Rows of `payload`. Record batches are read and cast one at a time as
    /// the rows are consumed.
    pub fn rows(&self, payload: Bytes) -> Result<ArrowRows> {
        let stream = Cursor::new(self.schema_message.clone()).chain(Cursor::new(payload));
        let reader = StreamReader::try_new(stream, None)?;
        Ok(ArrowRows {
            decoder: self.clone(),
            batches: Box::new(reader),
            current: None,
            row: 0,
        })
    }
}

fn read_schema(message: &Bytes) -> Result<Schema> {
    let reader = StreamReader::try_new(Cursor::new(message.clone()), None)?;
    Ok(reader.schema().as_ref().clone())
}

type BatchIter = Box<dyn Iterator<Item = std::result::Result<RecordBatch, ArrowError>> + Send>;

/// Rows of one payload, batch by batch.
pub struct ArrowRows {
    decoder: ArrowBatchDecoder,
    /// Record batches not yet read from the payload.
    batches: BatchIter,
    current: Option<ColumnarBatch>,
    row: usize,
}

impl Iterator for ArrowRows {
    type Item = Result<EngineRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = &mut self.current {
                if self.row < batch.num_rows() {
                    let row = batch.row(self.row);
                    self.row += 1;
                    return Some(row);
                }
                batch.close();
            }
            let next = self
                .batches
                .next()?
                .map_err(ConnectorError::from)
                .and_then(|batch| self.decoder.wrap(&batch));
            match next {
                Ok(batch) => {
                    self.current = Some(batch);
                    self.row = 0;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_arrow_batch, encode_arrow_schema};
    use arrow::array::{Int32Array, ListBuilder, StringBuilder};
    use arrow::datatypes::Field;

    fn wire_batch() -> RecordBatch {
        let mut tags = ListBuilder::new(StringBuilder::new()).with_field(Arc::new(Field::new(
            "item",
            DataType::Utf8,
            false,
        )));
        tags.values().append_value("a");
        tags.values().append_value("b");
        tags.append(true);
        tags.append(false);
        tags.append(true);

        let schema = Arc::new(Schema::new(vec![
            Field::new("word", DataType::Utf8, true),
            Field::new("n", DataType::Int32, true),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, false))),
                true,
            ),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("x"), None, Some("z")])),
                Arc::new(Int32Array::from(vec![Some(1), Some(2), None])),
                Arc::new(tags.finish()),
            ],
        )
        .unwrap()
    }

    fn target_schema() -> Schema {
        Schema::new(vec![
            Field::new("word", DataType::Utf8, true),
            Field::new("n", DataType::Int64, true),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Utf8, false))),
                true,
            ),
        ])
    }

    fn decoder(columns: &[&str]) -> ArrowBatchDecoder {
        let batch = wire_batch();
        let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let output = bqlink_core::schema::project_schema(&target_schema(), &cols).unwrap();
        ArrowBatchDecoder::new(encode_arrow_schema(batch.schema_ref()).unwrap(), output).unwrap()
    }

    #[test]
    fn test_rows_follow_requested_order_and_widen() {
        let batch = wire_batch();
        let dec = decoder(&["n", "word"]);
        let rows: Vec<EngineRow> = dec
            .rows(encode_arrow_batch(&batch).unwrap())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![ScalarValue::Int64(Some(1)), ScalarValue::Utf8(Some("x".into()))]);
        assert_eq!(rows[1][1], ScalarValue::Utf8(None));
        assert_eq!(rows[2][0], ScalarValue::Int64(None));
    }

    #[test]
    fn test_list_column() {
        let batch = wire_batch();
        let dec = decoder(&["tags"]);
        let rows: Vec<EngineRow> = dec
            .rows(encode_arrow_batch(&batch).unwrap())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let ScalarValue::List(first) = &rows[0][0] else {
            panic!("expected list");
        };
        assert_eq!(first.value_length(0), 2);
        assert!(rows[1][0].is_null());
        let ScalarValue::List(third) = &rows[2][0] else {
            panic!("expected list");
        };
        assert_eq!(third.value_length(0), 0);
    }

    #[test]
    fn test_accessor_bounds_and_nulls() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![Some(7), None]));
        let accessor = ColumnAccessor::new(&array).unwrap();
        assert_eq!(accessor.len(), 2);
        assert!(!accessor.is_null(0));
        assert!(accessor.is_null(1));
        assert_eq!(accessor.get(0).unwrap(), ScalarValue::Int64(Some(7)));
        assert_eq!(accessor.get_or_null(1).unwrap(), ScalarValue::Int64(None));
        assert!(matches!(accessor.get(2), Err(ConnectorError::Decode(_))));
    }

    #[test]
    fn test_close_releases_columns() {
        let array: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let mut batch = ColumnarBatch::new(vec![ColumnAccessor::new(&array).unwrap()], 3);
        assert_eq!(batch.row(2).unwrap(), vec![ScalarValue::Int64(Some(3))]);
        batch.close();
        assert!(batch.is_closed());
        assert!(batch.column(0).is_none());
        assert!(batch.row(0).is_err());
    }

    #[test]
    fn test_missing_column_rejected() {
        let batch = wire_batch();
        let output = Arc::new(Schema::new(vec![Field::new("other", DataType::Utf8, true)]));
        let err = ArrowBatchDecoder::new(encode_arrow_schema(batch.schema_ref()).unwrap(), output)
            .unwrap_err();
        assert!(err.to_string().contains("other"));
    }

    #[test]
    fn test_batches_are_read_on_demand() {
        let batch = wire_batch();
        let whole = encode_arrow_batch(&batch).unwrap();
        // A complete batch followed by the first half of another.
        let mut payload = whole.to_vec();
        payload.extend_from_slice(&whole[..whole.len() / 2]);

        let mut rows = decoder(&["n"]).rows(Bytes::from(payload)).unwrap();
        for expected in [Some(1), Some(2), None] {
            assert_eq!(rows.next().unwrap().unwrap(), vec![ScalarValue::Int64(expected)]);
        }
        assert!(rows.next().unwrap().is_err());
    }

    #[test]
    fn test_empty_projection_counts_rows() {
        let batch = wire_batch();
        let dec = decoder(&[]);
        let rows: Vec<EngineRow> = dec
            .rows(encode_arrow_batch(&batch).unwrap())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
    }
}
