//! Table metadata client.
//!
//! [`BigQueryClient`] wraps the control-plane API with the operations the
//! read and write paths need: table lookup, query jobs that materialize into
//! a destination table, job polling, expiration updates and row counts.

pub mod rest;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bqlink_core::model::{Job, JobConfiguration};
use bqlink_core::{ConnectorError, ReadConfig, Result, TableInfo, TableReference};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::retry::control_backoff;

/// Prefix of temporary destination tables created for view materialization.
pub const DESTINATION_TABLE_PREFIX: &str = "_bqc_";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// The warehouse control-plane API.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Table metadata, or `None` if the table does not exist.
    async fn get_table(&self, table: &TableReference) -> Result<Option<TableInfo>>;

    /// Persist mutable metadata (currently the expiration time).
    async fn update_table(&self, table: &TableInfo) -> Result<TableInfo>;

    /// Submit a job without waiting for it.
    async fn insert_job(&self, project: &str, job_id: &str, config: &JobConfiguration) -> Result<Job>;

    async fn get_job(&self, project: &str, job_id: &str, location: Option<&str>) -> Result<Job>;

    /// Run a `SELECT COUNT(*)` style statement and return its single value.
    async fn query_count(&self, project: &str, sql: &str) -> Result<u64>;
}

#[derive(Clone)]
pub struct BigQueryClient {
    api: Arc<dyn ControlApi>,
    parent_project: String,
    materialization_project: Option<String>,
    materialization_dataset: Option<String>,
    poll_interval: Duration,
    job_timeout: Duration,
    backoff: ExponentialBuilder,
}

impl std::fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("parent_project", &self.parent_project)
            .field("materialization_project", &self.materialization_project)
            .field("materialization_dataset", &self.materialization_dataset)
            .finish()
    }
}

impl BigQueryClient {
    pub fn new(api: Arc<dyn ControlApi>, parent_project: impl Into<String>) -> Self {
        Self {
            api,
            parent_project: parent_project.into(),
            materialization_project: None,
            materialization_dataset: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            backoff: control_backoff(),
        }
    }

    pub fn from_config(api: Arc<dyn ControlApi>, config: &ReadConfig) -> Self {
        Self::new(api, config.parent_project.clone()).with_materialization(
            config.materialization_project.clone(),
            config.materialization_dataset.clone(),
        )
    }

    pub fn with_materialization(mut self, project: Option<String>, dataset: Option<String>) -> Self {
        self.materialization_project = project;
        self.materialization_dataset = dataset;
        self
    }

    pub fn with_job_polling(mut self, poll_interval: Duration, job_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn parent_project(&self) -> &str {
        &self.parent_project
    }

    pub fn api(&self) -> &Arc<dyn ControlApi> {
        &self.api
    }

    pub async fn get_table(&self, table: &TableReference) -> Result<Option<TableInfo>> {
        (|| async { self.api.get_table(table).await })
            .retry(self.backoff.clone())
            .when(ConnectorError::is_retryable)
            .notify(|e, delay| {
                warn!("get_table '{}' failed, retrying in {:?}: {}", table, delay, e);
            })
            .await
    }

    pub async fn table_exists(&self, table: &TableReference) -> Result<bool> {
        Ok(self.get_table(table).await?.is_some())
    }

    /// Statement selecting `columns` of `table` under all `filters`.
    ///
    /// No columns means only the row count matters, so a constant is selected.
    pub fn create_sql(table: &TableReference, columns: &[String], filters: &[String]) -> String {
        let projection = if columns.is_empty() {
            "1".to_string()
        } else {
            columns
                .iter()
                .map(|c| format!("`{}`", c.replace('`', "\\`")))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let conditions: Vec<String> = filters
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|f| format!("({})", f))
            .collect();
        if conditions.is_empty() {
            format!("SELECT {} FROM {}", projection, table.sql())
        } else {
            format!(
                "SELECT {} FROM {} WHERE {}",
                projection,
                table.sql(),
                conditions.join(" AND ")
            )
        }
    }

    /// Fresh temporary table name in the materialization location.
    pub fn create_destination_table(&self, source: &TableReference) -> TableReference {
        TableReference::new(
            self.materialization_project
                .clone()
                .unwrap_or_else(|| source.project.clone()),
            self.materialization_dataset
                .clone()
                .unwrap_or_else(|| source.dataset.clone()),
            format!("{}{}", DESTINATION_TABLE_PREFIX, Uuid::new_v4().simple()),
        )
    }

    pub async fn submit(&self, config: JobConfiguration) -> Result<Job> {
        let job_id = format!("bqlink_{}", Uuid::new_v4().simple());
        let job = self
            .api
            .insert_job(&self.parent_project, &job_id, &config)
            .await?;
        debug!("Submitted job '{}' in project '{}'", job.job_id, job.project);
        Ok(job)
    }

    /// Submit a query writing its result to `destination`. Does not wait.
    pub async fn run_query_to_table(&self, sql: &str, destination: &TableReference) -> Result<Job> {
        info!("Materializing query into '{}': {}", destination, sql);
        self.submit(JobConfiguration::Query {
            sql: sql.to_string(),
            destination: destination.clone(),
        })
        .await
    }

    /// Poll `job` until it is done. A job that finishes with an error is
    /// reported as a service error naming the job.
    pub async fn wait_for(&self, job: Job) -> Result<Job> {
        let started = Instant::now();
        let mut job = job;
        loop {
            if job.is_done() {
                if let Some(err) = &job.error {
                    return Err(ConnectorError::Service {
                        status: 400,
                        reason: err.reason.clone(),
                        message: format!("job '{}' failed: {}", job.job_id, err.message),
                    });
                }
                debug!("Job '{}' done after {:?}", job.job_id, started.elapsed());
                return Ok(job);
            }
            if started.elapsed() >= self.job_timeout {
                return Err(ConnectorError::Transport(format!(
                    "timed out after {:?} waiting for job '{}'",
                    self.job_timeout, job.job_id
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            let (project, job_id, location) = (job.project.clone(), job.job_id.clone(), job.location.clone());
            job = (|| async {
                self.api
                    .get_job(&project, &job_id, location.as_deref())
                    .await
            })
            .retry(self.backoff.clone())
            .when(ConnectorError::is_retryable)
            .await?;
        }
    }

    pub async fn update(&self, table: &TableInfo) -> Result<TableInfo> {
        self.api.update_table(table).await
    }

    /// Row count of `table`, optionally under `filter`.
    ///
    /// Unfiltered counts come from table metadata; filtered ones run a query.
    pub async fn count_rows(&self, table: &TableReference, filter: Option<&str>) -> Result<u64> {
        match filter.map(str::trim).filter(|f| !f.is_empty()) {
            None => {
                let info = self
                    .get_table(table)
                    .await?
                    .ok_or_else(|| ConnectorError::TableNotFound(table.to_string()))?;
                match info.num_rows {
                    Some(n) => Ok(n),
                    None => self.query_count(table, None).await,
                }
            }
            Some(f) => self.query_count(table, Some(f)).await,
        }
    }

    async fn query_count(&self, table: &TableReference, filter: Option<&str>) -> Result<u64> {
        let sql = match filter {
            Some(f) => format!("SELECT COUNT(*) FROM {} WHERE {}", table.sql(), f),
            None => format!("SELECT COUNT(*) FROM {}", table.sql()),
        };
        debug!("Counting rows: {}", sql);
        self.api.query_count(&self.parent_project, &sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeControlApi;
    use bqlink_core::model::{JobError, TableSchema, TableType};

    fn client(api: Arc<FakeControlApi>) -> BigQueryClient {
        BigQueryClient::new(api, "billing")
            .with_job_polling(Duration::from_millis(1), Duration::from_secs(5))
    }

    #[test]
    fn test_create_sql() {
        let t = TableReference::new("p", "d", "v");
        assert_eq!(
            BigQueryClient::create_sql(&t, &["a".into(), "b".into()], &[]),
            "SELECT `a`, `b` FROM `p.d.v`"
        );
        assert_eq!(
            BigQueryClient::create_sql(&t, &["a".into()], &["x > 1".into(), " ".into(), "y = 'z'".into()]),
            "SELECT `a` FROM `p.d.v` WHERE (x > 1) AND (y = 'z')"
        );
    }

    #[test]
    fn test_create_sql_minimal_projection() {
        let t = TableReference::new("p", "d", "v");
        assert_eq!(
            BigQueryClient::create_sql(&t, &[], &["a IS NULL".into()]),
            "SELECT 1 FROM `p.d.v` WHERE (a IS NULL)"
        );
    }

    #[test]
    fn test_destination_table_location() {
        let api = Arc::new(FakeControlApi::new());
        let source = TableReference::new("src", "ds", "view");

        let dest = client(api.clone()).create_destination_table(&source);
        assert_eq!(dest.project, "src");
        assert_eq!(dest.dataset, "ds");
        assert!(dest.table.starts_with("_bqc_"));
        assert_eq!(dest.table.len(), "_bqc_".len() + 32);

        let dest = client(api)
            .with_materialization(Some("mp".into()), Some("md".into()))
            .create_destination_table(&source);
        assert_eq!((dest.project.as_str(), dest.dataset.as_str()), ("mp", "md"));
    }

    #[tokio::test]
    async fn test_query_job_creates_destination() {
        let api = Arc::new(FakeControlApi::new());
        let c = client(api.clone());
        let dest = TableReference::new("p", "d", "_bqc_x");
        let job = c.run_query_to_table("SELECT 1", &dest).await.unwrap();
        let job = c.wait_for(job).await.unwrap();
        assert!(job.is_done());
        assert_eq!(api.jobs_submitted(), 1);
        assert!(c.table_exists(&dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_job_is_reported() {
        let api = Arc::new(FakeControlApi::new().with_job_error(JobError {
            reason: "invalidQuery".into(),
            message: "Syntax error".into(),
            location: None,
        }));
        let c = client(api);
        let job = c
            .run_query_to_table("SELEC 1", &TableReference::new("p", "d", "t"))
            .await
            .unwrap();
        let err = c.wait_for(job).await.unwrap_err();
        assert!(err.to_string().contains("Syntax error"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_count_rows() {
        let api = Arc::new(FakeControlApi::new());
        let t = TableReference::new("p", "d", "t");
        let mut info = TableInfo::new(t.clone(), TableType::Table, TableSchema::default());
        info.num_rows = Some(42);
        api.add_table(info);
        api.set_query_count(7);

        let c = client(api);
        assert_eq!(c.count_rows(&t, None).await.unwrap(), 42);
        assert_eq!(c.count_rows(&t, Some("x = 1")).await.unwrap(), 7);
        assert!(matches!(
            c.count_rows(&TableReference::new("p", "d", "missing"), None).await,
            Err(ConnectorError::TableNotFound(_))
        ));
    }
}
