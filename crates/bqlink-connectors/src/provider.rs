//! DataFusion table provider over read sessions.
//!
//! Contains both the `BigQueryTable` (the `TableProvider`) and
//! `BigQueryScanExec` (the lazy `ExecutionPlan` whose partitions are the
//! streams of one read session).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::array::{RecordBatch, RecordBatchOptions};
use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use bqlink_core::model::{ReadSession, ReadSessionConfig};
use bqlink_core::schema::{project_schema, to_engine_schema};
use bqlink_core::{ConnectorError, ReadConfig, Result, TableInfo};
use datafusion::catalog::Session;
use datafusion::common::stats::Precision;
use datafusion::datasource::TableProvider;
use datafusion::error::{DataFusionError, Result as DFResult};
use datafusion::execution::TaskContext;
use datafusion::logical_expr::{TableProviderFilterPushDown, TableType};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::memory::MemoryExec;
use datafusion::physical_plan::metrics::{BaselineMetrics, ExecutionPlanMetricsSet, MetricsSet};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
    SendableRecordBatchStream, Statistics,
};
use datafusion::prelude::{Expr, SessionContext};
use tracing::{debug, info};

use crate::decode::RowDecoder;
use crate::filter::{combine_filters, compile_filter};
use crate::reader::StreamPartitionReader;
use crate::retry::ReadRetryPolicy;
use crate::session::ReadSessionCreator;
use crate::storage::StorageReadApi;

// ===========================================================================
// BigQueryTable
// ===========================================================================

/// A DataFusion `TableProvider` that reads a warehouse table or view through
/// the storage read API.
///
/// Every `scan()` creates a new read session; no rows are fetched until the
/// returned plan is executed.
pub struct BigQueryTable {
    creator: Arc<ReadSessionCreator>,
    config: ReadConfig,
    info: TableInfo,
    schema: SchemaRef,
    retry: ReadRetryPolicy,
}

impl fmt::Debug for BigQueryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryTable")
            .field("table", &self.config.table)
            .field("table_type", &self.info.table_type)
            .field("format", &self.config.read_format)
            .finish()
    }
}

impl BigQueryTable {
    /// Look up `config.table` and derive its engine schema.
    pub async fn try_new(creator: Arc<ReadSessionCreator>, config: ReadConfig) -> Result<Self> {
        let info = creator
            .client()
            .get_table(&config.table)
            .await?
            .ok_or_else(|| ConnectorError::TableNotFound(config.table.to_string()))?;
        let schema = to_engine_schema(&info.schema)?;
        info!(
            "BigQueryTable: table='{}', type={}, columns={}",
            config.table,
            info.table_type,
            schema.fields().len()
        );
        let retry = ReadRetryPolicy::new(config.max_read_rows_retries);
        Ok(Self {
            creator,
            config,
            info,
            schema,
            retry,
        })
    }

    pub fn with_retry_policy(mut self, retry: ReadRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn table_info(&self) -> &TableInfo {
        &self.info
    }

    pub fn config(&self) -> &ReadConfig {
        &self.config
    }

    /// The row restriction sent for a scan with `filters` pushed down.
    pub fn effective_filter(&self, filters: &[Expr]) -> Option<String> {
        let pushed: Vec<String> = filters.iter().filter_map(compile_filter).collect();
        combine_filters(
            self.config.filter.as_deref(),
            &pushed,
            self.config.combine_pushed_down_filters,
        )
    }

    /// Rows under `filter`, counted by the control plane.
    pub async fn count_rows(&self, filter: Option<&str>) -> Result<u64> {
        self.creator
            .client()
            .count_rows(&self.config.table, filter)
            .await
    }
}

/// Zero-column batches totalling `rows` rows.
fn empty_projection_batches(schema: SchemaRef, rows: u64, batch_size: usize) -> Result<Vec<RecordBatch>> {
    let batch_size = batch_size.max(1) as u64;
    let mut batches = Vec::new();
    let mut remaining = rows;
    while remaining > 0 {
        let n = remaining.min(batch_size);
        let options = RecordBatchOptions::new().with_row_count(Some(n as usize));
        batches.push(RecordBatch::try_new_with_options(
            Arc::clone(&schema),
            vec![],
            &options,
        )?);
        remaining -= n;
    }
    Ok(batches)
}

#[async_trait]
impl TableProvider for BigQueryTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    fn statistics(&self) -> Option<Statistics> {
        // Inexact: a configured filter may drop rows.
        self.info.num_rows.map(|n| Statistics {
            num_rows: Precision::Inexact(n as usize),
            total_byte_size: Precision::Absent,
            column_statistics: Statistics::unknown_column(&self.schema),
        })
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        Ok(filters
            .iter()
            .map(|f| match compile_filter(f) {
                Some(_) => TableProviderFilterPushDown::Inexact,
                None => TableProviderFilterPushDown::Unsupported,
            })
            .collect())
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        _limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let columns: Vec<String> = match projection {
            Some(indices) => indices
                .iter()
                .map(|&i| self.schema.field(i).name().clone())
                .collect(),
            None => self
                .schema
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect(),
        };
        let projected_schema = match projection {
            Some(indices) => Arc::new(self.schema.project(indices)?),
            None => Arc::clone(&self.schema),
        };
        let filter = self.effective_filter(filters);
        debug!(
            "Scan of '{}': columns={:?}, filter={:?}",
            self.config.table, columns, filter
        );

        if columns.is_empty() && self.config.optimized_empty_projection {
            let rows = self.count_rows(filter.as_deref()).await?;
            info!(
                "Empty projection on '{}' served from row count: rows={}",
                self.config.table, rows
            );
            let batches = empty_projection_batches(
                Arc::clone(&projected_schema),
                rows,
                state.config().batch_size(),
            )?;
            let exec = MemoryExec::try_new(&[batches], projected_schema, None)?;
            return Ok(Arc::new(exec));
        }

        let desired_streams = self
            .config
            .max_parallelism
            .unwrap_or_else(|| state.config().target_partitions());
        let session_config =
            ReadSessionConfig::new(desired_streams, &columns, filter.clone(), self.config.read_format);
        let response = self
            .creator
            .create(&self.config.table, &session_config)
            .await?;

        let exec = BigQueryScanExec::try_new(
            Arc::clone(self.creator.storage()),
            response.session,
            Arc::clone(&self.schema),
            session_config.requested_columns,
            filter,
            self.retry.clone(),
        )?;
        Ok(Arc::new(exec))
    }
}

/// Register a `BigQueryTable` with a DataFusion `SessionContext`.
pub async fn register(
    ctx: &SessionContext,
    table_name: &str,
    creator: Arc<ReadSessionCreator>,
    config: ReadConfig,
) -> Result<()> {
    let source = config.table.clone();
    let table = BigQueryTable::try_new(creator, config).await?;
    ctx.register_table(table_name, Arc::new(table))?;
    info!("Registered BigQueryTable '{}' -> '{}'", source, table_name);
    Ok(())
}

// ===========================================================================
// BigQueryScanExec
// ===========================================================================

/// A lazy `ExecutionPlan` with one partition per session stream.
///
/// Partition *i* opens a [`StreamPartitionReader`] on stream *i* when
/// executed. A session without streams still exposes one, empty, partition.
pub struct BigQueryScanExec {
    storage: Arc<dyn StorageReadApi>,
    session: ReadSession,
    table_schema: SchemaRef,
    columns: Vec<String>,
    schema: SchemaRef,
    filter: Option<String>,
    retry: ReadRetryPolicy,
    metrics: ExecutionPlanMetricsSet,
    properties: PlanProperties,
}

impl fmt::Debug for BigQueryScanExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryScanExec")
            .field("session", &self.session.name)
            .field("streams", &self.session.streams.len())
            .field("columns", &self.columns)
            .field("filter", &self.filter)
            .finish()
    }
}

impl BigQueryScanExec {
    /// `table_schema` is the full engine schema; `columns` selects and orders
    /// the output columns.
    pub fn try_new(
        storage: Arc<dyn StorageReadApi>,
        session: ReadSession,
        table_schema: SchemaRef,
        columns: Vec<String>,
        filter: Option<String>,
        retry: ReadRetryPolicy,
    ) -> Result<Self> {
        let schema = project_schema(&table_schema, &columns)?;
        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&schema)),
            Partitioning::UnknownPartitioning(session.streams.len().max(1)),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );
        Ok(Self {
            storage,
            session,
            table_schema,
            columns,
            schema,
            filter,
            retry,
            metrics: ExecutionPlanMetricsSet::new(),
            properties,
        })
    }

    pub fn session(&self) -> &ReadSession {
        &self.session
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }
}

impl ExecutionPlan for BigQueryScanExec {
    fn name(&self) -> &str {
        "BigQueryScanExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        if children.is_empty() {
            Ok(self)
        } else {
            Err(DataFusionError::Internal(
                "BigQueryScanExec is a leaf node and cannot have children".to_string(),
            ))
        }
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> DFResult<SendableRecordBatchStream> {
        let partitions = self.properties.partitioning.partition_count();
        if partition >= partitions {
            return Err(DataFusionError::Internal(format!(
                "BigQueryScanExec has {} partition(s), got {}",
                partitions, partition
            )));
        }

        let Some(stream) = self.session.streams.get(partition).cloned() else {
            return Ok(Box::pin(RecordBatchStreamAdapter::new(
                Arc::clone(&self.schema),
                futures::stream::empty::<DFResult<RecordBatch>>(),
            )));
        };

        let decoder = RowDecoder::new(&self.session.schema, &self.table_schema, &self.columns)?;
        let reader = StreamPartitionReader::open(
            Arc::clone(&self.storage),
            stream,
            decoder,
            self.retry.clone(),
        );
        let batch_size = context.session_config().batch_size();
        let baseline = BaselineMetrics::new(&self.metrics, partition);

        let batches = futures::stream::try_unfold(
            (reader, baseline),
            move |(mut reader, baseline)| async move {
                let timer = baseline.elapsed_compute().timer();
                let next = reader.next_batch(batch_size).await;
                timer.done();
                match next {
                    Ok(Some(batch)) => {
                        baseline.record_output(batch.num_rows());
                        Ok(Some((batch, (reader, baseline))))
                    }
                    Ok(None) => {
                        reader.close();
                        baseline.done();
                        Ok(None)
                    }
                    Err(e) => {
                        reader.close();
                        Err(DataFusionError::from(e))
                    }
                }
            },
        );

        Ok(Box::pin(RecordBatchStreamAdapter::new(
            Arc::clone(&self.schema),
            batches,
        )))
    }

    fn metrics(&self) -> Option<MetricsSet> {
        Some(self.metrics.clone_inner())
    }
}

impl DisplayAs for BigQueryScanExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BigQueryScanExec: table={}, streams={}, format={}, columns=[{}]",
            self.session.table,
            self.session.streams.len(),
            self.session.format(),
            self.columns.join(", ")
        )?;
        if let Some(filter) = &self.filter {
            write!(f, ", filter={}", filter)?;
        }
        Ok(())
    }
}
