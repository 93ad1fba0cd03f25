//! bqlink Core - shared model for the BigQuery connector
//!
//! This crate provides the pieces every other bqlink crate depends on:
//! - table references and the warehouse data model
//! - typed connector errors with a machine-checkable classification
//! - read/write option parsing
//! - conversion from warehouse column types to engine (Arrow) types

pub mod config;
pub mod error;
pub mod model;
pub mod schema;
pub mod table_ref;

pub use config::{OptionMap, ReadConfig, WriteConfig};
pub use error::{ConnectorError, ErrorCode, Result};
pub use model::{DataFormat, TableInfo, TableType};
pub use table_ref::TableReference;
