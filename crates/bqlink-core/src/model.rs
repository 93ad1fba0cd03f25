//! Warehouse data model shared by the control plane and the storage read API.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CreateDisposition, IntermediateFormat, SchemaUpdateOption, TimePartitioning};
use crate::error::{ConnectorError, Result};
use crate::table_ref::TableReference;

// ===========================================================================
// Table schema
// ===========================================================================

/// Column type as declared in the warehouse schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    BigNumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    DateTime,
    Geography,
    Json,
    Record,
    Interval,
    Range,
    Other(String),
}

impl From<String> for FieldType {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => FieldType::String,
            "BYTES" => FieldType::Bytes,
            "INTEGER" | "INT64" => FieldType::Integer,
            "FLOAT" | "FLOAT64" => FieldType::Float,
            "NUMERIC" | "DECIMAL" => FieldType::Numeric,
            "BIGNUMERIC" | "BIGDECIMAL" => FieldType::BigNumeric,
            "BOOLEAN" | "BOOL" => FieldType::Boolean,
            "TIMESTAMP" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "TIME" => FieldType::Time,
            "DATETIME" => FieldType::DateTime,
            "GEOGRAPHY" => FieldType::Geography,
            "JSON" => FieldType::Json,
            "RECORD" | "STRUCT" => FieldType::Record,
            "INTERVAL" => FieldType::Interval,
            "RANGE" => FieldType::Range,
            _ => FieldType::Other(s),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "STRING",
            FieldType::Bytes => "BYTES",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Numeric => "NUMERIC",
            FieldType::BigNumeric => "BIGNUMERIC",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Geography => "GEOGRAPHY",
            FieldType::Json => "JSON",
            FieldType::Record => "RECORD",
            FieldType::Interval => "INTERVAL",
            FieldType::Range => "RANGE",
            FieldType::Other(other) => other.as_str(),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// One column of a [`TableSchema`]. Field names follow the REST wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
    #[serde(default, with = "numeric_string", skip_serializing_if = "Option::is_none")]
    pub precision: Option<u64>,
    #[serde(default, with = "numeric_string", skip_serializing_if = "Option::is_none")]
    pub scale: Option<u64>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode,
            fields: vec![],
            precision: None,
            scale: None,
        }
    }

    pub fn record(name: impl Into<String>, mode: FieldMode, fields: Vec<FieldSchema>) -> Self {
        Self {
            fields,
            ..Self::new(name, FieldType::Record, mode)
        }
    }

    pub fn with_precision(mut self, precision: u64, scale: u64) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Ordered column list of a table or view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Keep only `columns`, in the given order. Unknown names are skipped.
    pub fn project(&self, columns: &[String]) -> TableSchema {
        if columns.is_empty() {
            return self.clone();
        }
        TableSchema::new(
            columns
                .iter()
                .filter_map(|c| self.field(c).cloned())
                .collect(),
        )
    }
}

/// The REST API encodes 64-bit integers as JSON strings.
mod numeric_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Num(n)) => Ok(Some(n)),
            Some(Raw::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

// ===========================================================================
// Tables
// ===========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableType {
    Table,
    View,
    MaterializedView,
    External,
    Snapshot,
    Other(String),
}

impl From<&str> for TableType {
    fn from(s: &str) -> Self {
        match s {
            "TABLE" => TableType::Table,
            "VIEW" => TableType::View,
            "MATERIALIZED_VIEW" => TableType::MaterializedView,
            "EXTERNAL" => TableType::External,
            "SNAPSHOT" => TableType::Snapshot,
            other => TableType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableType::Table => f.write_str("TABLE"),
            TableType::View => f.write_str("VIEW"),
            TableType::MaterializedView => f.write_str("MATERIALIZED_VIEW"),
            TableType::External => f.write_str("EXTERNAL"),
            TableType::Snapshot => f.write_str("SNAPSHOT"),
            TableType::Other(other) => f.write_str(other),
        }
    }
}

/// Metadata of a table, view or other relation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub reference: TableReference,
    pub table_type: TableType,
    pub schema: TableSchema,
    pub num_rows: Option<u64>,
    pub creation_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
}

impl TableInfo {
    pub fn new(reference: TableReference, table_type: TableType, schema: TableSchema) -> Self {
        Self {
            reference,
            table_type,
            schema,
            num_rows: None,
            creation_time: None,
            expiration_time: None,
        }
    }
}

// ===========================================================================
// Read sessions
// ===========================================================================

/// Wire format negotiated for a read session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    /// Row-oriented, self-describing binary records.
    #[default]
    Avro,
    /// Column-oriented record batches.
    Arrow,
}

impl FromStr for DataFormat {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVRO" => Ok(DataFormat::Avro),
            "ARROW" => Ok(DataFormat::Arrow),
            other => Err(ConnectorError::Configuration(format!(
                "Data read format '{}' is not supported. Supported formats are 'ARROW,AVRO'",
                other
            ))),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Avro => f.write_str("AVRO"),
            DataFormat::Arrow => f.write_str("ARROW"),
        }
    }
}

/// Server-side policy for distributing rows across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingStrategy {
    Liquid,
    /// Roughly the same number of rows per stream.
    Balanced,
}

/// Per-read request parameters. Column order is preserved, duplicates dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSessionConfig {
    pub desired_streams: usize,
    pub requested_columns: Vec<String>,
    pub filter: Option<String>,
    pub format: DataFormat,
}

impl ReadSessionConfig {
    pub fn new(
        desired_streams: usize,
        requested_columns: &[String],
        filter: Option<String>,
        format: DataFormat,
    ) -> Self {
        let mut columns: Vec<String> = Vec::with_capacity(requested_columns.len());
        for c in requested_columns {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
        Self {
            desired_streams: desired_streams.max(1),
            requested_columns: columns,
            filter: filter.filter(|f| !f.trim().is_empty()),
            format,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReadSessionRequest {
    /// `projects/<parent project>`
    pub parent: String,
    pub table: TableReference,
    pub format: DataFormat,
    pub requested_streams: usize,
    pub selected_fields: Vec<String>,
    pub row_restriction: Option<String>,
    pub sharding_strategy: ShardingStrategy,
}

/// Schema of the rows carried by a session's streams, in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSchema {
    /// Avro writer schema as JSON.
    Avro(String),
    /// Serialized Arrow IPC schema message.
    Arrow(Bytes),
}

impl SessionSchema {
    pub fn format(&self) -> DataFormat {
        match self {
            SessionSchema::Avro(_) => DataFormat::Avro,
            SessionSchema::Arrow(_) => DataFormat::Arrow,
        }
    }
}

/// Opaque token for one partition's row range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stream {
    pub name: String,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Server-issued read session handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSession {
    pub name: String,
    pub table: TableReference,
    pub streams: Vec<Stream>,
    pub schema: SessionSchema,
}

impl ReadSession {
    pub fn format(&self) -> DataFormat {
        self.schema.format()
    }
}

/// Resume point for a stream read: rows before `offset` are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRowsRequest {
    pub stream: Stream,
    pub offset: u64,
}

/// One encoded row block received from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRowsBatch {
    pub row_count: u64,
    pub payload: Bytes,
}

// ===========================================================================
// Jobs
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl From<&str> for JobState {
    fn from(s: &str) -> Self {
        match s {
            "DONE" => JobState::Done,
            "RUNNING" => JobState::Running,
            _ => JobState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub reason: String,
    pub message: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub project: String,
    pub job_id: String,
    pub location: Option<String>,
    pub state: JobState,
    pub error: Option<JobError>,
}

impl Job {
    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    WriteAppend,
    WriteTruncate,
    WriteEmpty,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::WriteAppend => "WRITE_APPEND",
            WriteDisposition::WriteTruncate => "WRITE_TRUNCATE",
            WriteDisposition::WriteEmpty => "WRITE_EMPTY",
        }
    }
}

/// Load job parameters for the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub source_uris: Vec<String>,
    pub format: IntermediateFormat,
    pub destination: TableReference,
    pub write_disposition: WriteDisposition,
    pub create_disposition: Option<CreateDisposition>,
    pub schema_update_options: Vec<SchemaUpdateOption>,
    pub time_partitioning: Option<TimePartitioning>,
    pub clustering_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobConfiguration {
    Query {
        sql: String,
        destination: TableReference,
    },
    Load(LoadJob),
}
