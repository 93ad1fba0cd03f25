//! REST implementation of [`ControlApi`].

use async_trait::async_trait;
use bqlink_core::model::{
    Job, JobConfiguration, JobError, JobState, LoadJob, TableSchema, TableType,
};
use bqlink_core::{ConnectorError, Result, TableInfo, TableReference};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::ControlApi;

pub const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2/";

/// Supplies bearer tokens for API calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed access token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub struct RestControlApi {
    client: reqwest::Client,
    base_url: Url,
    tokens: Box<dyn TokenProvider>,
}

impl std::fmt::Debug for RestControlApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestControlApi")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl RestControlApi {
    pub fn new(tokens: Box<dyn TokenProvider>) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, tokens)
    }

    pub fn with_base_url(base_url: &str, tokens: Box<dyn TokenProvider>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ConnectorError::Configuration(format!("invalid base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ConnectorError::Configuration(format!(
                "base URL '{}' cannot carry a path",
                base_url
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            tokens,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn table_url(&self, table: &TableReference) -> Url {
        self.url(&[
            "projects",
            &table.project,
            "datasets",
            &table.dataset,
            "tables",
            &table.table,
        ])
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;
        Err(service_error(status, &body))
    }

    async fn json(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        self.send(request)
            .await?
            .json::<Value>()
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl ControlApi for RestControlApi {
    async fn get_table(&self, table: &TableReference) -> Result<Option<TableInfo>> {
        debug!("GET table '{}'", table);
        match self.json(self.client.get(self.table_url(table))).await {
            Ok(body) => Ok(Some(table_from_json(&body)?)),
            Err(ConnectorError::Service { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_table(&self, table: &TableInfo) -> Result<TableInfo> {
        let body = json!({
            "expirationTime": table.expiration_time.map(|t| t.timestamp_millis().to_string()),
        });
        let response = self
            .json(self.client.patch(self.table_url(&table.reference)).json(&body))
            .await?;
        table_from_json(&response)
    }

    async fn insert_job(&self, project: &str, job_id: &str, config: &JobConfiguration) -> Result<Job> {
        let body = job_body(project, job_id, config);
        let response = self
            .json(self.client.post(self.url(&["projects", project, "jobs"])).json(&body))
            .await?;
        job_from_json(&response)
    }

    async fn get_job(&self, project: &str, job_id: &str, location: Option<&str>) -> Result<Job> {
        let mut url = self.url(&["projects", project, "jobs", job_id]);
        if let Some(location) = location {
            url.query_pairs_mut().append_pair("location", location);
        }
        job_from_json(&self.json(self.client.get(url)).await?)
    }

    async fn query_count(&self, project: &str, sql: &str) -> Result<u64> {
        let body = json!({ "query": sql, "useLegacySql": false, "timeoutMs": 60_000 });
        let response = self
            .json(self.client.post(self.url(&["projects", project, "queries"])).json(&body))
            .await?;
        count_from_json(&response)
    }
}

fn transport_error(e: reqwest::Error) -> ConnectorError {
    ConnectorError::Transport(e.to_string())
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

fn service_error(status: u16, body: &str) -> ConnectorError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => ConnectorError::Service {
            status,
            reason: envelope
                .error
                .errors
                .first()
                .map(|e| e.reason.clone())
                .unwrap_or_default(),
            message: envelope.error.message,
        },
        Err(_) => ConnectorError::Service {
            status,
            reason: String::new(),
            message: body.to_string(),
        },
    }
}

// ===========================================================================
// JSON mapping
// ===========================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReferenceJson {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableJson {
    table_reference: TableReferenceJson,
    #[serde(rename = "type", default)]
    table_type: Option<String>,
    #[serde(default)]
    schema: TableSchema,
    num_rows: Option<String>,
    creation_time: Option<String>,
    expiration_time: Option<String>,
}

fn millis(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

fn table_from_json(body: &Value) -> Result<TableInfo> {
    let table = TableJson::deserialize(body)?;
    let reference = TableReference::new(
        table.table_reference.project_id,
        table.table_reference.dataset_id,
        table.table_reference.table_id,
    );
    let mut info = TableInfo::new(
        reference,
        TableType::from(table.table_type.as_deref().unwrap_or("TABLE")),
        table.schema,
    );
    info.num_rows = table.num_rows.and_then(|n| n.parse().ok());
    info.creation_time = millis(table.creation_time.as_deref());
    info.expiration_time = millis(table.expiration_time.as_deref());
    Ok(info)
}

fn table_ref_json(table: &TableReference) -> Value {
    json!({
        "projectId": table.project,
        "datasetId": table.dataset,
        "tableId": table.table,
    })
}

fn load_json(load: &LoadJob) -> Value {
    let mut config = json!({
        "sourceUris": load.source_uris,
        "sourceFormat": load.format.as_str(),
        "destinationTable": table_ref_json(&load.destination),
        "writeDisposition": load.write_disposition.as_str(),
    });
    if let Some(create) = load.create_disposition {
        config["createDisposition"] = json!(create.as_str());
    }
    if !load.schema_update_options.is_empty() {
        config["schemaUpdateOptions"] = json!(load
            .schema_update_options
            .iter()
            .map(|o| o.as_str())
            .collect::<Vec<_>>());
    }
    if let Some(partitioning) = &load.time_partitioning {
        let mut tp = json!({
            "type": partitioning.partition_type,
            "requirePartitionFilter": partitioning.require_filter,
        });
        if let Some(field) = &partitioning.field {
            tp["field"] = json!(field);
        }
        if let Some(ms) = partitioning.expiration_ms {
            tp["expirationMs"] = json!(ms.to_string());
        }
        config["timePartitioning"] = tp;
    }
    if !load.clustering_fields.is_empty() {
        config["clustering"] = json!({ "fields": load.clustering_fields });
    }
    config
}

fn job_body(project: &str, job_id: &str, config: &JobConfiguration) -> Value {
    let configuration = match config {
        JobConfiguration::Query { sql, destination } => json!({
            "query": {
                "query": sql,
                "useLegacySql": false,
                "destinationTable": table_ref_json(destination),
                "createDisposition": "CREATE_IF_NEEDED",
                "writeDisposition": "WRITE_TRUNCATE",
            }
        }),
        JobConfiguration::Load(load) => json!({ "load": load_json(load) }),
    };
    json!({
        "jobReference": { "projectId": project, "jobId": job_id },
        "configuration": configuration,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobJson {
    job_reference: JobReferenceJson,
    #[serde(default)]
    status: Option<JobStatusJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceJson {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusJson {
    #[serde(default)]
    state: String,
    error_result: Option<JobErrorJson>,
}

#[derive(Deserialize)]
struct JobErrorJson {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
    location: Option<String>,
}

fn job_from_json(body: &Value) -> Result<Job> {
    let job = JobJson::deserialize(body)?;
    let (state, error) = match job.status {
        Some(status) => (
            JobState::from(status.state.as_str()),
            status.error_result.map(|e| JobError {
                reason: e.reason,
                message: e.message,
                location: e.location,
            }),
        ),
        None => (JobState::Pending, None),
    };
    Ok(Job {
        project: job.job_reference.project_id,
        job_id: job.job_reference.job_id,
        location: job.job_reference.location,
        state,
        error,
    })
}

fn count_from_json(body: &Value) -> Result<u64> {
    if body.get("jobComplete").and_then(Value::as_bool) == Some(false) {
        return Err(ConnectorError::Transport(
            "count query did not complete in time".to_string(),
        ));
    }
    body.pointer("/rows/0/f/0/v")
        .and_then(Value::as_str)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ConnectorError::Decode(format!("unexpected count response: {}", body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bqlink_core::config::{CreateDisposition, IntermediateFormat, TimePartitioning};
    use bqlink_core::model::{FieldType, WriteDisposition};

    fn api() -> RestControlApi {
        RestControlApi::with_base_url(
            "https://example.test/bigquery/v2",
            Box::new(StaticToken("t".into())),
        )
        .unwrap()
    }

    #[test]
    fn test_urls_are_encoded() {
        let url = api().table_url(&TableReference::new("example.com:p", "d", "t 1"));
        assert_eq!(
            url.as_str(),
            "https://example.test/bigquery/v2/projects/example.com:p/datasets/d/tables/t%201"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = RestControlApi::with_base_url("not a url", Box::new(StaticToken("t".into())))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[test]
    fn test_table_from_json() {
        let body = json!({
            "tableReference": {"projectId": "p", "datasetId": "d", "tableId": "v"},
            "type": "VIEW",
            "schema": {"fields": [{"name": "word", "type": "STRING", "mode": "NULLABLE"}]},
            "numRows": "164656",
            "creationTime": "1700000000000",
        });
        let info = table_from_json(&body).unwrap();
        assert_eq!(info.reference, TableReference::new("p", "d", "v"));
        assert_eq!(info.table_type, TableType::View);
        assert_eq!(info.schema.fields[0].field_type, FieldType::String);
        assert_eq!(info.num_rows, Some(164_656));
        assert_eq!(info.creation_time.unwrap().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(info.expiration_time, None);
    }

    #[test]
    fn test_job_from_json() {
        let body = json!({
            "jobReference": {"projectId": "p", "jobId": "j1", "location": "US"},
            "status": {"state": "DONE", "errorResult": {"reason": "invalidQuery", "message": "bad"}},
        });
        let job = job_from_json(&body).unwrap();
        assert!(job.is_done());
        assert_eq!(job.location.as_deref(), Some("US"));
        assert_eq!(job.error.unwrap().reason, "invalidQuery");

        let pending = job_from_json(&json!({"jobReference": {"projectId": "p", "jobId": "j2"}})).unwrap();
        assert_eq!(pending.state, JobState::Pending);
    }

    #[test]
    fn test_query_job_body() {
        let body = job_body(
            "billing",
            "j1",
            &JobConfiguration::Query {
                sql: "SELECT 1".into(),
                destination: TableReference::new("p", "d", "_bqc_1"),
            },
        );
        assert_eq!(body["jobReference"]["jobId"], "j1");
        assert_eq!(body["configuration"]["query"]["useLegacySql"], false);
        assert_eq!(body["configuration"]["query"]["destinationTable"]["tableId"], "_bqc_1");
    }

    #[test]
    fn test_load_job_body() {
        let load = LoadJob {
            source_uris: vec!["gs://b/x/part-00000.parquet".into()],
            format: IntermediateFormat::Parquet,
            destination: TableReference::new("p", "d", "t"),
            write_disposition: WriteDisposition::WriteTruncate,
            create_disposition: Some(CreateDisposition::CreateNever),
            schema_update_options: vec![],
            time_partitioning: Some(TimePartitioning {
                field: Some("ts".into()),
                expiration_ms: Some(1000),
                partition_type: "DAY".into(),
                require_filter: false,
            }),
            clustering_fields: vec!["a".into()],
        };
        let body = job_body("p", "j", &JobConfiguration::Load(load));
        let load = &body["configuration"]["load"];
        assert_eq!(load["sourceFormat"], "PARQUET");
        assert_eq!(load["writeDisposition"], "WRITE_TRUNCATE");
        assert_eq!(load["createDisposition"], "CREATE_NEVER");
        assert_eq!(load["timePartitioning"]["expirationMs"], "1000");
        assert_eq!(load["clustering"]["fields"][0], "a");
        assert!(load.get("schemaUpdateOptions").is_none());
    }

    #[test]
    fn test_service_error_parsing() {
        let body = r#"{"error": {"code": 503, "message": "try later", "errors": [{"reason": "backendError"}]}}"#;
        let err = service_error(503, body);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("try later"));

        let err = service_error(404, "<html>not found</html>");
        assert!(matches!(err, ConnectorError::Service { status: 404, .. }));
    }

    #[test]
    fn test_count_from_json() {
        let body = json!({"jobComplete": true, "rows": [{"f": [{"v": "12"}]}]});
        assert_eq!(count_from_json(&body).unwrap(), 12);
        assert!(count_from_json(&json!({"jobComplete": false})).unwrap_err().is_retryable());
    }
}
