//! Binary row decoding.
//!
//! A [`RowDecoder`] is built once per stream from the session's wire schema
//! and the caller's ordered column list. Each payload received from the
//! stream then decodes into [`DecodedRows`], a forward-only iterator of
//! engine rows whose values follow the ordered column list.

pub mod avro;
pub mod ipc;

use std::sync::Arc;

use ::arrow::array::{new_empty_array, ArrayRef, RecordBatch, RecordBatchOptions};
use ::arrow::datatypes::SchemaRef;
use bqlink_core::model::SessionSchema;
use bqlink_core::{ConnectorError, Result};
use bytes::Bytes;
use datafusion::scalar::ScalarValue;

pub use self::avro::{AvroRowConverter, AvroRows};
pub use self::ipc::{ArrowBatchDecoder, ArrowRows, ColumnAccessor, ColumnarBatch};

/// One decoded row, one value per requested column.
pub type EngineRow = Vec<ScalarValue>;

enum Format {
    Avro(AvroRowConverter),
    Arrow(ArrowBatchDecoder),
}

/// Per-stream decoder for either wire format.
pub struct RowDecoder {
    output_schema: SchemaRef,
    format: Format,
}

impl std::fmt::Debug for RowDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let format = match self.format {
            Format::Avro(_) => "AVRO",
            Format::Arrow(_) => "ARROW",
        };
        f.debug_struct("RowDecoder")
            .field("format", &format)
            .field("columns", &self.output_schema.fields().len())
            .finish()
    }
}

impl RowDecoder {
    /// Build the column plan for one stream.
    ///
    /// `target_schema` carries the engine types expected for each column;
    /// `ordered_columns` selects and orders them. An empty column list
    /// decodes every row to an empty row.
    pub fn new(
        session_schema: &SessionSchema,
        target_schema: &::arrow::datatypes::Schema,
        ordered_columns: &[String],
    ) -> Result<Self> {
        let output_schema = bqlink_core::schema::project_schema(target_schema, ordered_columns)?;
        let format = match session_schema {
            SessionSchema::Avro(json) => {
                Format::Avro(AvroRowConverter::new(json, Arc::clone(&output_schema))?)
            }
            SessionSchema::Arrow(bytes) => Format::Arrow(ArrowBatchDecoder::new(
                bytes.clone(),
                Arc::clone(&output_schema),
            )?),
        };
        Ok(Self {
            output_schema,
            format,
        })
    }

    /// Schema of the rows this decoder yields.
    pub fn output_schema(&self) -> SchemaRef {
        Arc::clone(&self.output_schema)
    }

    pub fn decode(&self, payload: Bytes) -> Result<DecodedRows> {
        match &self.format {
            Format::Avro(converter) => Ok(DecodedRows::Avro(converter.rows(payload))),
            Format::Arrow(decoder) => Ok(DecodedRows::Arrow(decoder.rows(payload)?)),
        }
    }
}

/// Rows of one payload, consumed once in order.
pub enum DecodedRows {
    Avro(AvroRows),
    Arrow(ArrowRows),
}

impl Iterator for DecodedRows {
    type Item = Result<EngineRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            DecodedRows::Avro(rows) => rows.next(),
            DecodedRows::Arrow(rows) => rows.next(),
        }
    }
}

/// Assemble engine rows into a batch of `schema`.
pub fn rows_to_record_batch(schema: SchemaRef, rows: Vec<EngineRow>) -> Result<RecordBatch> {
    let num_rows = rows.len();
    let num_columns = schema.fields().len();

    if num_columns == 0 {
        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        return Ok(RecordBatch::try_new_with_options(schema, vec![], &options)?);
    }

    let mut columns: Vec<Vec<ScalarValue>> = (0..num_columns)
        .map(|_| Vec::with_capacity(num_rows))
        .collect();
    for row in rows {
        if row.len() != num_columns {
            return Err(ConnectorError::Decode(format!(
                "row has {} values, expected {}",
                row.len(),
                num_columns
            )));
        }
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(value);
        }
    }

    let arrays = columns
        .into_iter()
        .zip(schema.fields().iter())
        .map(|(values, field)| {
            if values.is_empty() {
                Ok(new_empty_array(field.data_type()))
            } else {
                ScalarValue::iter_to_array(values).map_err(ConnectorError::from)
            }
        })
        .collect::<Result<Vec<ArrayRef>>>()?;

    Ok(RecordBatch::try_new(schema, arrays)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::arrow::array::{Array, Int64Array, StringArray};
    use ::arrow::datatypes::{DataType, Field, Schema};

    #[test]
    fn test_rows_to_record_batch() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        let rows = vec![
            vec![ScalarValue::Int64(Some(1)), ScalarValue::Utf8(Some("a".into()))],
            vec![ScalarValue::Int64(None), ScalarValue::Utf8(None)],
        ];
        let batch = rows_to_record_batch(schema, rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let ids = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.value(0), 1);
        assert!(ids.is_null(1));
        let names = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(0), "a");
    }

    #[test]
    fn test_rows_to_record_batch_without_columns() {
        let schema = Arc::new(Schema::empty());
        let batch = rows_to_record_batch(schema, vec![vec![], vec![], vec![]]).unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), 0);
    }

    #[test]
    fn test_rows_to_record_batch_empty() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]));
        let batch = rows_to_record_batch(schema, vec![]).unwrap();
        assert_eq!(batch.num_rows(), 0);
    }

    #[test]
    fn test_rows_to_record_batch_ragged_row() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, true)]));
        let err = rows_to_record_batch(schema, vec![vec![]]).unwrap_err();
        assert!(matches!(err, ConnectorError::Decode(_)));
    }
}
