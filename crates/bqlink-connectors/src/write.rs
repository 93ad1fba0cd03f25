//! Write path.
//!
//! Batches are staged as files in a bucket, loaded into the destination
//! table with a load job, and the staging directory is removed afterwards.

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bqlink_core::config::{IntermediateFormat, WriteAction};
use bqlink_core::model::{Job, JobConfiguration, LoadJob, WriteDisposition};
use bqlink_core::{ConnectorError, Result, TableReference, WriteConfig};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::BigQueryClient;

/// Files written by a [`Stager`] for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedLocation {
    pub bucket: String,
    /// Staging directory inside the bucket, e.g. `.bqlink-<uuid>`.
    pub prefix: String,
    /// Object keys relative to the bucket root.
    pub objects: Vec<String>,
    pub format: IntermediateFormat,
    pub rows: u64,
}

impl StagedLocation {
    /// `gs://` URI of the staging directory.
    pub fn uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.prefix)
    }

    pub fn source_uris(&self) -> Vec<String> {
        self.objects
            .iter()
            .map(|o| format!("gs://{}/{}", self.bucket, o))
            .collect()
    }
}

#[async_trait]
pub trait Stager: Send + Sync {
    async fn stage(
        &self,
        schema: SchemaRef,
        batches: &[RecordBatch],
        format: IntermediateFormat,
    ) -> Result<StagedLocation>;

    /// Remove everything under the staged location.
    async fn cleanup(&self, location: &StagedLocation) -> Result<()>;
}

/// Stages Parquet files through an [`ObjectStore`].
pub struct ObjectStoreStager {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl std::fmt::Debug for ObjectStoreStager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreStager")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreStager {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Stager backed by Google Cloud Storage, with credentials taken from the
    /// environment.
    pub fn gcs(bucket: &str) -> Result<Self> {
        let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| {
                ConnectorError::Configuration(format!(
                    "cannot access bucket '{}': {}",
                    bucket, e
                ))
            })?;
        Ok(Self::new(Arc::new(store), bucket))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn encode_parquet(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
            .map_err(parquet_error)?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(parquet_error)?;
        }
        writer
            .close()
            .map_err(parquet_error)?;
        Ok(buffer)
    }
}

fn parquet_error(e: ParquetError) -> ConnectorError {
    ConnectorError::Engine(format!("cannot encode staged Parquet: {}", e))
}

#[async_trait]
impl Stager for ObjectStoreStager {
    async fn stage(
        &self,
        schema: SchemaRef,
        batches: &[RecordBatch],
        format: IntermediateFormat,
    ) -> Result<StagedLocation> {
        if format != IntermediateFormat::Parquet {
            return Err(ConnectorError::Unsupported(format!(
                "staging data as {} is not supported, use intermediateFormat=PARQUET",
                format.as_str()
            )));
        }

        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        let payload = Self::encode_parquet(schema, batches)?;
        let prefix = format!(".bqlink-{}", Uuid::new_v4().simple());
        let key = format!("{}/part-00000.{}", prefix, format.extension());
        let size = payload.len();

        self.store
            .put(&ObjectPath::from(key.as_str()), PutPayload::from(payload))
            .await
            .map_err(|e| ConnectorError::Transport(format!("staging to '{}' failed: {}", key, e)))?;

        info!(
            "Staged {} rows ({} bytes) to gs://{}/{}",
            rows, size, self.bucket, key
        );
        Ok(StagedLocation {
            bucket: self.bucket.clone(),
            prefix,
            objects: vec![key],
            format,
            rows: rows as u64,
        })
    }

    async fn cleanup(&self, location: &StagedLocation) -> Result<()> {
        for object in &location.objects {
            self.store
                .delete(&ObjectPath::from(object.as_str()))
                .await
                .map_err(|e| {
                    ConnectorError::Transport(format!("deleting '{}' failed: {}", object, e))
                })?;
        }
        debug!("Removed staging directory {}", location.uri());
        Ok(())
    }
}

/// Options of a load job besides its source and destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub create_disposition: Option<bqlink_core::config::CreateDisposition>,
    pub schema_update_options: Vec<bqlink_core::config::SchemaUpdateOption>,
    pub time_partitioning: Option<bqlink_core::config::TimePartitioning>,
    pub clustering_fields: Vec<String>,
}

impl LoadOptions {
    pub fn from_config(config: &WriteConfig) -> Self {
        Self {
            create_disposition: config.create_disposition,
            schema_update_options: config.schema_update_options.clone(),
            time_partitioning: config.time_partitioning.clone(),
            clustering_fields: config.clustered_fields.clone(),
        }
    }
}

/// Loads staged files into a table.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Submit the load. The returned job may still be running.
    async fn load(
        &self,
        location: &StagedLocation,
        table: &TableReference,
        mode: WriteDisposition,
        options: &LoadOptions,
    ) -> Result<Job>;

    async fn wait(&self, job: Job) -> Result<Job>;
}

#[async_trait]
impl Loader for BigQueryClient {
    async fn load(
        &self,
        location: &StagedLocation,
        table: &TableReference,
        mode: WriteDisposition,
        options: &LoadOptions,
    ) -> Result<Job> {
        info!(
            "Loading {} into '{}' ({})",
            location.uri(),
            table,
            mode.as_str()
        );
        self.submit(JobConfiguration::Load(LoadJob {
            source_uris: location.source_uris(),
            format: location.format,
            destination: table.clone(),
            write_disposition: mode,
            create_disposition: options.create_disposition,
            schema_update_options: options.schema_update_options.clone(),
            time_partitioning: options.time_partitioning.clone(),
            clustering_fields: options.clustering_fields.clone(),
        }))
        .await
    }

    async fn wait(&self, job: Job) -> Result<Job> {
        self.wait_for(job).await
    }
}

/// What a call to [`BigQueryWriter::write`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The table existed and the save mode says to leave it alone.
    Skipped,
    Loaded { job: Job, rows: u64 },
}

/// Writes record batches into a table according to a [`WriteConfig`].
pub struct BigQueryWriter {
    client: BigQueryClient,
    stager: Arc<dyn Stager>,
    loader: Arc<dyn Loader>,
    config: WriteConfig,
}

impl BigQueryWriter {
    pub fn new(client: BigQueryClient, stager: Arc<dyn Stager>, config: WriteConfig) -> Self {
        let loader = Arc::new(client.clone());
        Self {
            client,
            stager,
            loader,
            config,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    pub async fn write(&self, schema: SchemaRef, batches: &[RecordBatch]) -> Result<WriteOutcome> {
        let table = &self.config.table;
        let exists = self.client.table_exists(table).await?;
        let mode = match self.config.save_mode.plan(exists) {
            WriteAction::Skip => {
                info!("Table '{}' exists, skipping write", table);
                return Ok(WriteOutcome::Skipped);
            }
            WriteAction::Fail => {
                return Err(ConnectorError::Configuration(format!(
                    "SaveMode is set to ErrorIfExists and table '{}' already exists. \
                     Set the save mode to Append or Overwrite to write to it",
                    table
                )));
            }
            WriteAction::Append => WriteDisposition::WriteAppend,
            WriteAction::Truncate => WriteDisposition::WriteTruncate,
        };

        let location = self
            .stager
            .stage(schema, batches, self.config.intermediate_format)
            .await?;
        let result = self.load(&location, mode).await;

        if let Err(e) = self.stager.cleanup(&location).await {
            warn!("Could not clean up {}: {}", location.uri(), e);
        }

        let job = result?;
        info!("Wrote {} rows to '{}'", location.rows, table);
        Ok(WriteOutcome::Loaded {
            job,
            rows: location.rows,
        })
    }

    async fn load(&self, location: &StagedLocation, mode: WriteDisposition) -> Result<Job> {
        let options = LoadOptions::from_config(&self.config);
        let job = self
            .loader
            .load(location, &self.config.table, mode, &options)
            .await?;
        self.loader.wait(job).await
    }
}
