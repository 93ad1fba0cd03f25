//! Per-stream partition reader.
//!
//! A [`StreamPartitionReader`] owns one stream of a read session. It pulls
//! encoded row blocks through [`StorageReadApi::read_rows`], decodes them
//! with the stream's [`RowDecoder`] and hands rows out one at a time.
//!
//! Transient failures reopen the stream at the number of rows received so
//! far. Only consecutive failures count against the retry budget; every
//! block received resets it.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use backon::ExponentialBackoff;
use bqlink_core::model::{ReadRowsBatch, ReadRowsRequest, Stream};
use bqlink_core::{ConnectorError, Result};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::decode::{rows_to_record_batch, DecodedRows, EngineRow, RowDecoder};
use crate::retry::ReadRetryPolicy;
use crate::storage::{ReadRowsStream, StorageReadApi};

/// Counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadMetrics {
    /// Rows handed out by `next_row`.
    pub rows: u64,
    pub batches: u64,
    /// Encoded payload bytes received.
    pub bytes: u64,
    pub retries: u64,
}

pub struct StreamPartitionReader {
    api: Arc<dyn StorageReadApi>,
    stream: Stream,
    decoder: RowDecoder,
    policy: ReadRetryPolicy,
    response: Option<ReadRowsStream>,
    current: Option<DecodedRows>,
    peeked: Option<EngineRow>,
    /// Rows in all blocks received so far; the resume point after a failure.
    offset: u64,
    finished: bool,
    /// First error returned; the reader stays failed after it.
    failure: Option<ConnectorError>,
    closed: bool,
    metrics: ReadMetrics,
}

impl std::fmt::Debug for StreamPartitionReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPartitionReader")
            .field("stream", &self.stream.name)
            .field("offset", &self.offset)
            .field("finished", &self.finished)
            .field("failed", &self.failure.is_some())
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl StreamPartitionReader {
    /// Reader for `stream`. The read call is issued by the first `has_next`.
    pub fn open(
        api: Arc<dyn StorageReadApi>,
        stream: Stream,
        decoder: RowDecoder,
        policy: ReadRetryPolicy,
    ) -> Self {
        debug!("Opening reader on stream '{}'", stream.name);
        Self {
            api,
            stream,
            decoder,
            policy,
            response: None,
            current: None,
            peeked: None,
            offset: 0,
            finished: false,
            failure: None,
            closed: false,
            metrics: ReadMetrics::default(),
        }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn schema(&self) -> SchemaRef {
        self.decoder.output_schema()
    }

    pub fn metrics(&self) -> ReadMetrics {
        self.metrics
    }

    /// Whether another row is available. Never consumes a row; may fetch and
    /// decode the next block.
    ///
    /// An error is terminal: the rest of the failed block cannot be recovered,
    /// so every later call returns the same error.
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        match self.advance().await {
            Ok(available) => Ok(available),
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> Result<bool> {
        loop {
            if self.peeked.is_some() {
                return Ok(true);
            }
            if self.closed {
                return Ok(false);
            }
            if let Some(rows) = self.current.as_mut() {
                match rows.next() {
                    Some(Ok(row)) => {
                        self.peeked = Some(row);
                        return Ok(true);
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            }
            if self.finished {
                return Ok(false);
            }
            match self.fetch_batch().await? {
                Some(batch) => self.current = Some(self.decoder.decode(batch.payload)?),
                None => self.finished = true,
            }
        }
    }

    fn fail(&mut self, error: ConnectorError) {
        warn!(
            "Stream '{}' failed after {} rows, reader is done: {}",
            self.stream.name, self.metrics.rows, error
        );
        self.failure = Some(error);
        self.finished = true;
        self.response = None;
        self.current = None;
        self.peeked = None;
    }

    /// Consume exactly one row, or `None` at the end of the stream.
    pub async fn next_row(&mut self) -> Result<Option<EngineRow>> {
        if !self.has_next().await? {
            return Ok(None);
        }
        let row = self.peeked.take();
        if row.is_some() {
            self.metrics.rows += 1;
        }
        Ok(row)
    }

    /// Up to `max_rows` rows as one batch, or `None` at the end of the stream.
    pub async fn next_batch(&mut self, max_rows: usize) -> Result<Option<RecordBatch>> {
        let max_rows = max_rows.max(1);
        let mut rows = Vec::with_capacity(max_rows.min(8192));
        while rows.len() < max_rows {
            match self.next_row().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }
        rows_to_record_batch(self.decoder.output_schema(), rows).map(Some)
    }

    /// Release the open read call and any decoded block. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response = None;
        self.current = None;
        self.peeked = None;
        info!(
            "Closed stream '{}': rows={}, batches={}, bytes={}, retries={}",
            self.stream.name,
            self.metrics.rows,
            self.metrics.batches,
            self.metrics.bytes,
            self.metrics.retries
        );
    }

    /// Next block of the stream, reopening it on transient failures.
    async fn fetch_batch(&mut self) -> Result<Option<ReadRowsBatch>> {
        let mut delays = self.policy.delays();
        let mut failures = 0u32;
        loop {
            if self.response.is_none() {
                let request = ReadRowsRequest {
                    stream: self.stream.clone(),
                    offset: self.offset,
                };
                match self.api.read_rows(request).await {
                    Ok(response) => self.response = Some(response),
                    Err(e) => {
                        self.on_failure(e, &mut failures, &mut delays).await?;
                        continue;
                    }
                }
            }
            let next = match self.response.as_mut() {
                Some(response) => response.next().await,
                None => continue,
            };

            match next {
                None => {
                    self.response = None;
                    return Ok(None);
                }
                Some(Ok(batch)) => {
                    self.offset += batch.row_count;
                    self.metrics.batches += 1;
                    self.metrics.bytes += batch.payload.len() as u64;
                    return Ok(Some(batch));
                }
                Some(Err(e)) => {
                    self.response = None;
                    self.on_failure(e, &mut failures, &mut delays).await?;
                }
            }
        }
    }

    async fn on_failure(
        &mut self,
        error: ConnectorError,
        failures: &mut u32,
        delays: &mut ExponentialBackoff,
    ) -> Result<()> {
        *failures += 1;
        if !error.is_retryable() || *failures >= self.policy.max_attempts {
            return Err(ConnectorError::StreamReadFailure {
                stream: self.stream.name.clone(),
                attempts: *failures,
                message: error.to_string(),
            });
        }
        let delay = delays.next().unwrap_or_default();
        self.metrics.retries += 1;
        warn!(
            "Read of stream '{}' failed at offset {} (attempt {}/{}), retrying in {:?}: {}",
            self.stream.name, self.offset, failures, self.policy.max_attempts, delay, error
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
