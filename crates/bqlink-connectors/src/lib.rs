//! bqlink Connectors - BigQuery access for DataFusion
//!
//! This crate provides:
//! - the control-plane client (table metadata, query and load jobs)
//! - read session creation with view materialization and caching
//! - per-stream readers decoding Avro rows or Arrow IPC batches
//! - a DataFusion `TableProvider` and scan plan over read sessions
//! - the staging/load write path
//! - in-memory fakes of both service APIs under [`testing`]

pub mod cache;
pub mod client;
pub mod decode;
pub mod filter;
pub mod provider;
pub mod reader;
pub mod retry;
pub mod session;
pub mod storage;
pub mod testing;
pub mod write;

pub use cache::{Clock, DestinationTableCache, ManualClock, SystemClock};
pub use client::rest::{RestControlApi, StaticToken, TokenProvider};
pub use client::{BigQueryClient, ControlApi};
pub use decode::{DecodedRows, EngineRow, RowDecoder};
pub use filter::{combine_filters, compile_filter};
pub use provider::{register, BigQueryScanExec, BigQueryTable};
pub use reader::{ReadMetrics, StreamPartitionReader};
pub use retry::ReadRetryPolicy;
pub use session::{ReadSessionCreator, ReadSessionResponse, SessionState};
pub use storage::StorageReadApi;
pub use write::{
    BigQueryWriter, LoadOptions, Loader, ObjectStoreStager, StagedLocation, Stager, WriteOutcome,
};
