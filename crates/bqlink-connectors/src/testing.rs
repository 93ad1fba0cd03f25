//! In-memory fakes of the control and storage APIs.
//!
//! Used by this crate's tests and by embedders that want to exercise the
//! read path without a warehouse. Both fakes count the calls made against
//! them so tests can assert on side effects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use apache_avro::schema::Schema as AvroSchema;
use apache_avro::to_avro_datum;
use apache_avro::types::Value as AvroValue;
use arrow::array::RecordBatch;
use arrow::datatypes::Schema;
use arrow::ipc::writer::StreamWriter;
use async_trait::async_trait;
use bqlink_core::model::{
    CreateReadSessionRequest, DataFormat, Job, JobConfiguration, JobError, JobState, LoadJob,
    ReadRowsBatch, ReadRowsRequest, ReadSession, SessionSchema, Stream, TableSchema, TableType,
};
use bqlink_core::{ConnectorError, Result, TableInfo, TableReference};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;

use crate::client::ControlApi;
use crate::storage::{ReadRowsStream, StorageReadApi};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===========================================================================
// Payload encoders
// ===========================================================================

/// Concatenated binary datums, as carried by one row-oriented block.
pub fn encode_avro_rows(schema: &AvroSchema, rows: &[AvroValue]) -> Result<Bytes> {
    let mut out = Vec::new();
    for row in rows {
        let datum = to_avro_datum(schema, row.clone())
            .map_err(|e| ConnectorError::Decode(format!("cannot encode Avro row: {}", e)))?;
        out.extend_from_slice(&datum);
    }
    Ok(Bytes::from(out))
}

/// Serialized IPC schema message.
pub fn encode_arrow_schema(schema: &Schema) -> Result<Bytes> {
    let writer = StreamWriter::try_new(Vec::new(), schema)?;
    Ok(Bytes::from(writer.get_ref().clone()))
}

/// Serialized record batch message, without the schema that precedes it on
/// the wire.
pub fn encode_arrow_batch(batch: &RecordBatch) -> Result<Bytes> {
    let mut writer = StreamWriter::try_new(Vec::new(), batch.schema_ref())?;
    let schema_len = writer.get_ref().len();
    writer.write(batch)?;
    let batch_end = writer.get_ref().len();
    let buf = Bytes::from(writer.into_inner()?);
    Ok(buf.slice(schema_len..batch_end))
}

/// Rows and wire schema backing one fake table.
#[derive(Debug, Clone)]
pub struct TableData {
    pub schema: SessionSchema,
    pub batches: Vec<ReadRowsBatch>,
}

impl TableData {
    /// Avro-encoded table, split into blocks of `rows_per_batch` rows.
    pub fn avro(schema_json: &str, rows: &[AvroValue], rows_per_batch: usize) -> Result<Self> {
        let schema = AvroSchema::parse_str(schema_json)
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        let batches = rows
            .chunks(rows_per_batch.max(1))
            .map(|chunk| {
                Ok(ReadRowsBatch {
                    row_count: chunk.len() as u64,
                    payload: encode_avro_rows(&schema, chunk)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema: SessionSchema::Avro(schema_json.to_string()),
            batches,
        })
    }

    /// Arrow-encoded table with one block per record batch.
    pub fn arrow(schema: &Schema, batches: &[RecordBatch]) -> Result<Self> {
        Ok(Self {
            schema: SessionSchema::Arrow(encode_arrow_schema(schema)?),
            batches: batches
                .iter()
                .map(|b| {
                    Ok(ReadRowsBatch {
                        row_count: b.num_rows() as u64,
                        payload: encode_arrow_batch(b)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn row_count(&self) -> u64 {
        self.batches.iter().map(|b| b.row_count).sum()
    }
}

// ===========================================================================
// Control API
// ===========================================================================

#[derive(Debug, Default)]
pub struct FakeControlApi {
    tables: Mutex<HashMap<TableReference, TableInfo>>,
    jobs: Mutex<HashMap<String, Job>>,
    loads: Mutex<Vec<LoadJob>>,
    queries: Mutex<Vec<String>>,
    jobs_submitted: AtomicUsize,
    updates: AtomicUsize,
    query_count: AtomicU64,
    job_delay: Option<Duration>,
    job_error: Mutex<Option<JobError>>,
}

impl FakeControlApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job takes `delay` to submit.
    pub fn with_job_delay(mut self, delay: Duration) -> Self {
        self.job_delay = Some(delay);
        self
    }

    /// Every job finishes with `error`.
    pub fn with_job_error(self, error: JobError) -> Self {
        self.set_job_error(Some(error));
        self
    }

    /// Jobs submitted from now on finish with `error`, or succeed on `None`.
    pub fn set_job_error(&self, error: Option<JobError>) {
        *lock(&self.job_error) = error;
    }

    pub fn add_table(&self, info: TableInfo) {
        lock(&self.tables).insert(info.reference.clone(), info);
    }

    pub fn table(&self, reference: &TableReference) -> Option<TableInfo> {
        lock(&self.tables).get(reference).cloned()
    }

    pub fn set_query_count(&self, count: u64) {
        self.query_count.store(count, Ordering::SeqCst);
    }

    pub fn jobs_submitted(&self) -> usize {
        self.jobs_submitted.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> Vec<LoadJob> {
        lock(&self.loads).clone()
    }

    /// SQL of every query job and count query, in submission order.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    /// Schema of the first registered table referenced by `sql`.
    fn schema_for_query(&self, sql: &str) -> TableSchema {
        lock(&self.tables)
            .values()
            .find(|t| sql.contains(&t.reference.sql()))
            .map(|t| t.schema.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ControlApi for FakeControlApi {
    async fn get_table(&self, table: &TableReference) -> Result<Option<TableInfo>> {
        Ok(self.table(table))
    }

    async fn update_table(&self, table: &TableInfo) -> Result<TableInfo> {
        let mut tables = lock(&self.tables);
        let stored = tables
            .get_mut(&table.reference)
            .ok_or_else(|| ConnectorError::TableNotFound(table.reference.to_string()))?;
        stored.expiration_time = table.expiration_time;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn insert_job(&self, project: &str, job_id: &str, config: &JobConfiguration) -> Result<Job> {
        self.jobs_submitted.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.job_delay {
            tokio::time::sleep(delay).await;
        }

        let job_error = lock(&self.job_error).clone();
        if job_error.is_none() {
            match config {
                JobConfiguration::Query { sql, destination } => {
                    lock(&self.queries).push(sql.clone());
                    let mut info = TableInfo::new(
                        destination.clone(),
                        TableType::Table,
                        self.schema_for_query(sql),
                    );
                    info.creation_time = Some(Utc::now());
                    self.add_table(info);
                }
                JobConfiguration::Load(load) => {
                    lock(&self.loads).push(load.clone());
                    let mut tables = lock(&self.tables);
                    tables.entry(load.destination.clone()).or_insert_with(|| {
                        TableInfo::new(
                            load.destination.clone(),
                            TableType::Table,
                            TableSchema::default(),
                        )
                    });
                }
            }
        }

        let job = Job {
            project: project.to_string(),
            job_id: job_id.to_string(),
            location: None,
            state: JobState::Done,
            error: job_error,
        };
        lock(&self.jobs).insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, _project: &str, job_id: &str, _location: Option<&str>) -> Result<Job> {
        lock(&self.jobs).get(job_id).cloned().ok_or_else(|| ConnectorError::Service {
            status: 404,
            reason: "notFound".to_string(),
            message: format!("job '{}' not found", job_id),
        })
    }

    async fn query_count(&self, _project: &str, sql: &str) -> Result<u64> {
        lock(&self.queries).push(sql.to_string());
        Ok(self.query_count.load(Ordering::SeqCst))
    }
}

// ===========================================================================
// Storage read API
// ===========================================================================

/// Injected failures for one stream.
#[derive(Debug, Clone, Copy)]
pub struct FailurePlan {
    /// How many `read_rows` calls fail.
    pub times: u32,
    /// Blocks delivered by a failing call before the error.
    pub after_batches: usize,
    pub retryable: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: Mutex<HashMap<(TableReference, DataFormat), TableData>>,
    defaults: Mutex<HashMap<DataFormat, TableData>>,
    streams: Mutex<HashMap<String, Vec<ReadRowsBatch>>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
    session_requests: Mutex<Vec<CreateReadSessionRequest>>,
    read_requests: Mutex<Vec<ReadRowsRequest>>,
    sessions_created: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, table: TableReference, data: TableData) {
        let format = data.schema.format();
        lock(&self.tables).insert((table, format), data);
    }

    /// Data served for tables that were not registered, such as freshly
    /// materialized destination tables.
    pub fn set_default(&self, data: TableData) {
        lock(&self.defaults).insert(data.schema.format(), data);
    }

    /// Register a stream directly, bypassing session creation.
    pub fn add_stream(&self, name: &str, batches: Vec<ReadRowsBatch>) -> Stream {
        lock(&self.streams).insert(name.to_string(), batches);
        Stream::new(name)
    }

    pub fn fail_stream(&self, name: &str, plan: FailurePlan) {
        lock(&self.failures).insert(name.to_string(), plan);
    }

    pub fn session_requests(&self) -> Vec<CreateReadSessionRequest> {
        lock(&self.session_requests).clone()
    }

    pub fn last_session_request(&self) -> Option<CreateReadSessionRequest> {
        lock(&self.session_requests).last().cloned()
    }

    pub fn read_requests(&self) -> Vec<ReadRowsRequest> {
        lock(&self.read_requests).clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageReadApi for InMemoryStorage {
    async fn create_read_session(&self, request: CreateReadSessionRequest) -> Result<ReadSession> {
        lock(&self.session_requests).push(request.clone());
        let id = self.sessions_created.fetch_add(1, Ordering::SeqCst);

        let data = lock(&self.tables)
            .get(&(request.table.clone(), request.format))
            .cloned()
            .or_else(|| lock(&self.defaults).get(&request.format).cloned())
            .ok_or_else(|| {
                ConnectorError::TableNotFound(format!(
                    "{} has no {} data",
                    request.table, request.format
                ))
            })?;

        let name = format!("projects/{}/sessions/s{}", request.table.project, id);
        let num_streams = request.requested_streams.max(1).min(data.batches.len());
        let mut per_stream: Vec<Vec<ReadRowsBatch>> = vec![vec![]; num_streams];
        for (i, batch) in data.batches.into_iter().enumerate() {
            per_stream[i % num_streams].push(batch);
        }

        let mut streams = Vec::with_capacity(num_streams);
        let mut registry = lock(&self.streams);
        for (i, batches) in per_stream.into_iter().enumerate() {
            let stream = Stream::new(format!("{}/streams/{}", name, i));
            registry.insert(stream.name.clone(), batches);
            streams.push(stream);
        }

        Ok(ReadSession {
            name,
            table: request.table,
            streams,
            schema: data.schema,
        })
    }

    async fn read_rows(&self, request: ReadRowsRequest) -> Result<ReadRowsStream> {
        lock(&self.read_requests).push(request.clone());
        let batches = lock(&self.streams)
            .get(&request.stream.name)
            .cloned()
            .ok_or_else(|| ConnectorError::Service {
                status: 404,
                reason: "notFound".to_string(),
                message: format!("stream '{}' not found", request.stream.name),
            })?;

        let mut skipped = 0u64;
        let mut remaining = Vec::new();
        for batch in batches {
            if skipped < request.offset {
                skipped += batch.row_count;
                continue;
            }
            remaining.push(batch);
        }
        if skipped != request.offset {
            return Err(ConnectorError::Service {
                status: 400,
                reason: "invalid".to_string(),
                message: format!("offset {} is not at a block boundary", request.offset),
            });
        }

        let failure = {
            let mut failures = lock(&self.failures);
            match failures.get_mut(&request.stream.name) {
                Some(plan) if plan.times > 0 => {
                    plan.times -= 1;
                    Some(*plan)
                }
                _ => None,
            }
        };

        let items: Vec<Result<ReadRowsBatch>> = match failure {
            None => remaining.into_iter().map(Ok).collect(),
            Some(plan) => {
                let mut items: Vec<Result<ReadRowsBatch>> = remaining
                    .into_iter()
                    .take(plan.after_batches)
                    .map(Ok)
                    .collect();
                items.push(Err(if plan.retryable {
                    ConnectorError::Transport("connection reset by peer".to_string())
                } else {
                    ConnectorError::Service {
                        status: 403,
                        reason: "accessDenied".to_string(),
                        message: "permission denied on stream".to_string(),
                    }
                }));
                items
            }
        };
        Ok(futures::stream::iter(items).boxed())
    }
}
