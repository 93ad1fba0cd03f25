//! Read session creation.
//!
//! Resolves a logical table to the physical table that can be streamed,
//! materializing views into cached temporary tables, then asks the storage
//! API for a read session split into parallel streams.

use std::fmt;
use std::sync::Arc;

use bqlink_core::config::DEFAULT_VIEW_EXPIRATION_HOURS;
use bqlink_core::model::{
    CreateReadSessionRequest, ReadSession, ReadSessionConfig, ShardingStrategy, TableType,
};
use bqlink_core::{ConnectorError, ReadConfig, Result, TableInfo, TableReference};
use chrono::{TimeDelta, Utc};
use tracing::{debug, info};

use crate::cache::DestinationTableCache;
use crate::client::BigQueryClient;
use crate::storage::StorageReadApi;

/// Option that gates view materialization.
pub const VIEWS_ENABLED_OPTION: &str = "viewsEnabled";

/// Phases of [`ReadSessionCreator::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ResolvingTable,
    MaterializingIfView,
    BuildingReadOptions,
    SessionCreated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::ResolvingTable => "ResolvingTable",
            SessionState::MaterializingIfView => "MaterializingIfView",
            SessionState::BuildingReadOptions => "BuildingReadOptions",
            SessionState::SessionCreated => "SessionCreated",
        };
        f.write_str(name)
    }
}

/// A created session and the physical table it reads.
#[derive(Debug, Clone)]
pub struct ReadSessionResponse {
    pub session: ReadSession,
    /// The table itself, or the temporary table a view was materialized into.
    pub table_info: TableInfo,
}

pub struct ReadSessionCreator {
    client: BigQueryClient,
    storage: Arc<dyn StorageReadApi>,
    cache: Arc<DestinationTableCache>,
    views_enabled: bool,
    view_expiration_hours: u32,
}

impl fmt::Debug for ReadSessionCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSessionCreator")
            .field("client", &self.client)
            .field("views_enabled", &self.views_enabled)
            .field("view_expiration_hours", &self.view_expiration_hours)
            .finish()
    }
}

impl ReadSessionCreator {
    /// Creator with views disabled.
    pub fn new(
        client: BigQueryClient,
        storage: Arc<dyn StorageReadApi>,
        cache: Arc<DestinationTableCache>,
    ) -> Self {
        Self {
            client,
            storage,
            cache,
            views_enabled: false,
            view_expiration_hours: DEFAULT_VIEW_EXPIRATION_HOURS,
        }
    }

    pub fn from_config(
        client: BigQueryClient,
        storage: Arc<dyn StorageReadApi>,
        cache: Arc<DestinationTableCache>,
        config: &ReadConfig,
    ) -> Self {
        Self::new(client, storage, cache).with_views(config.views_enabled, config.view_expiration_hours)
    }

    pub fn with_views(mut self, enabled: bool, expiration_hours: u32) -> Self {
        self.views_enabled = enabled;
        self.view_expiration_hours = expiration_hours;
        self
    }

    pub fn client(&self) -> &BigQueryClient {
        &self.client
    }

    pub fn storage(&self) -> &Arc<dyn StorageReadApi> {
        &self.storage
    }

    /// Create a read session over `table`.
    ///
    /// Views are materialized with the requested columns and filter applied,
    /// so their session carries no row restriction of its own.
    pub async fn create(
        &self,
        table: &TableReference,
        config: &ReadSessionConfig,
    ) -> Result<ReadSessionResponse> {
        log_state(SessionState::ResolvingTable, table);
        let info = self
            .client
            .get_table(table)
            .await?
            .ok_or_else(|| ConnectorError::TableNotFound(table.to_string()))?;

        let filters: Vec<String> = config.filter.iter().cloned().collect();
        let (actual, row_restriction) = match info.table_type.clone() {
            TableType::Table => (info, config.filter.clone()),
            TableType::View => {
                if !self.views_enabled {
                    return Err(ConnectorError::Unsupported(format!(
                        "Views are not enabled. You can enable views by setting '{}' to true. \
                         Notice additional cost may occur.",
                        VIEWS_ENABLED_OPTION
                    )));
                }
                log_state(SessionState::MaterializingIfView, table);
                let sql = BigQueryClient::create_sql(table, &config.requested_columns, &filters);
                debug!("Materialization query for '{}': {}", table, sql);
                let actual = self
                    .cache
                    .get_or_try_insert_with(&sql, || self.materialize(&sql, table))
                    .await?;
                (actual, None)
            }
            other => {
                return Err(ConnectorError::Unsupported(format!(
                    "Table type '{}' of table '{}.{}' is not supported",
                    other, table.dataset, table.table
                )));
            }
        };

        log_state(SessionState::BuildingReadOptions, &actual.reference);
        let request = CreateReadSessionRequest {
            parent: format!("projects/{}", self.client.parent_project()),
            table: actual.reference.clone(),
            format: config.format,
            requested_streams: config.desired_streams,
            selected_fields: config.requested_columns.clone(),
            row_restriction,
            sharding_strategy: ShardingStrategy::Balanced,
        };
        let session = self.storage.create_read_session(request).await?;

        log_state(SessionState::SessionCreated, &actual.reference);
        info!(
            "Created read session '{}' on '{}': streams={}, format={}",
            session.name,
            actual.reference,
            session.streams.len(),
            session.format()
        );
        Ok(ReadSessionResponse {
            session,
            table_info: actual,
        })
    }

    /// Run `sql` into a fresh temporary table and stamp its expiration.
    async fn materialize(&self, sql: &str, view: &TableReference) -> Result<TableInfo> {
        let failure = |job_id: Option<&str>, e: ConnectorError| ConnectorError::MaterializationFailure {
            sql: sql.to_string(),
            job_id: job_id.map(str::to_string),
            message: e.to_string(),
        };

        let destination = self.client.create_destination_table(view);
        debug!("Destination table for '{}' is '{}'", view, destination);
        let job = self
            .client
            .run_query_to_table(sql, &destination)
            .await
            .map_err(|e| failure(None, e))?;
        let job_id = job.job_id.clone();
        self.client
            .wait_for(job)
            .await
            .map_err(|e| failure(Some(&job_id), e))?;

        let mut created = self
            .client
            .get_table(&destination)
            .await
            .map_err(|e| failure(Some(&job_id), e))?
            .ok_or_else(|| {
                failure(
                    Some(&job_id),
                    ConnectorError::TableNotFound(destination.to_string()),
                )
            })?;
        let created_at = created.creation_time.unwrap_or_else(Utc::now);
        created.expiration_time =
            Some(created_at + TimeDelta::hours(i64::from(self.view_expiration_hours)));
        let updated = self
            .client
            .update(&created)
            .await
            .map_err(|e| failure(Some(&job_id), e))?;

        info!(
            "Materialized view '{}' into '{}' (job '{}'), expires at {:?}",
            view, updated.reference, job_id, updated.expiration_time
        );
        Ok(updated)
    }
}

fn log_state(state: SessionState, table: &TableReference) {
    debug!("Read session state: {} table='{}'", state, table);
}
