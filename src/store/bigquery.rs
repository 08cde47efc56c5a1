//! BigQuery v2 REST implementation of [`TableStore`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{CreateOutcome, JobHandle, StoreError, TableSpec, TableStore, WriteMode};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};

pub const DEFAULT_API_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_UPLOAD_BASE_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
const MULTIPART_BOUNDARY: &str = "asa_export_load_part";

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset_id: String,
    /// Dataset location, e.g. `US`. Passed along to job lookups when set.
    pub location: Option<String>,
    pub api_base_url: String,
    pub upload_base_url: String,
    pub access_token: String,
    /// Delay between job status polls.
    pub poll_interval: Duration,
}

impl BigQueryConfig {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            location: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            upload_base_url: DEFAULT_UPLOAD_BASE_URL.to_string(),
            access_token: access_token.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Fully qualified table id as written in standard SQL.
    pub fn qualified_table(&self, table: &str) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, table)
    }
}

pub struct BigQueryStore<T> {
    transport: Arc<T>,
    config: BigQueryConfig,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: JobReference,
    #[serde(default)]
    job_complete: bool,
    /// int64 values are JSON strings in this API.
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<JobErrorProto>,
}

#[derive(Debug, Deserialize)]
struct JobErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl<T: HttpTransport> BigQueryStore<T> {
    pub fn new(transport: Arc<T>, config: BigQueryConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    fn project_url(&self) -> String {
        format!(
            "{}/projects/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.project_id
        )
    }

    fn dataset_url(&self) -> String {
        format!("{}/datasets/{}", self.project_url(), self.config.dataset_id)
    }

    fn location_query(&self, location: Option<&str>) -> String {
        location
            .or(self.config.location.as_deref())
            .map(|loc| format!("?location={}", urlencoding::encode(loc)))
            .unwrap_or_default()
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, StoreError> {
        let request = request.header(
            "Authorization",
            format!("Bearer {}", self.config.access_token),
        );
        Ok(self.transport.execute(request).await?)
    }

    async fn poll_query(&self, mut response: QueryResponse) -> Result<QueryResponse, StoreError> {
        while !response.job_complete {
            tokio::time::sleep(self.config.poll_interval).await;
            let url = format!(
                "{}/queries/{}{}",
                self.project_url(),
                response.job_reference.job_id,
                self.location_query(response.job_reference.location.as_deref())
            );
            let reply = self.send(HttpRequest::get(url)).await?;
            response = parse_api_response(&reply, "getQueryResults")?;
        }
        Ok(response)
    }
}

/// Decode a 2xx response or turn the error envelope into [`StoreError::Http`].
fn parse_api_response<P: DeserializeOwned>(
    response: &HttpResponse,
    operation: &'static str,
) -> Result<P, StoreError> {
    if !response.is_success() {
        return Err(http_error(response, operation));
    }
    response.json().map_err(|e| StoreError::UnexpectedShape {
        operation,
        message: e.to_string(),
    })
}

fn http_error(response: &HttpResponse, operation: &'static str) -> StoreError {
    let message = response
        .json::<ErrorEnvelope>()
        .map(|envelope| envelope.error.message)
        .unwrap_or_else(|_| response.body.chars().take(256).collect());
    StoreError::Http {
        operation,
        status: response.status,
        message,
    }
}

/// `tables.insert` body for a DAY-partitioned table with required columns.
pub fn table_resource(config: &BigQueryConfig, spec: &TableSpec) -> Value {
    json!({
        "tableReference": {
            "projectId": config.project_id,
            "datasetId": config.dataset_id,
            "tableId": spec.name,
        },
        "description": spec.description,
        "schema": { "fields": schema_fields(spec) },
        "timePartitioning": { "type": "DAY", "field": spec.partition_field },
    })
}

fn schema_fields(spec: &TableSpec) -> Vec<Value> {
    spec.columns
        .iter()
        .map(|column| {
            json!({
                "name": column.name,
                "type": column.column_type.as_str(),
                "mode": "REQUIRED",
            })
        })
        .collect()
}

/// `jobs.insert` configuration for a tab-delimited load.
pub fn load_configuration(config: &BigQueryConfig, spec: &TableSpec, mode: WriteMode) -> Value {
    let mut job = json!({
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": config.project_id,
                    "datasetId": config.dataset_id,
                    "tableId": spec.name,
                },
                "sourceFormat": "CSV",
                "fieldDelimiter": "\t",
                "quote": "",
                "writeDisposition": mode.disposition(),
                "createDisposition": "CREATE_NEVER",
                "schema": { "fields": schema_fields(spec) },
            }
        }
    });
    if let Some(location) = &config.location {
        job["jobReference"] = json!({ "location": location });
    }
    job
}

fn multipart_body(metadata: &Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{MULTIPART_BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

impl<T: HttpTransport> TableStore for BigQueryStore<T> {
    async fn ensure_dataset(&self) -> Result<(), StoreError> {
        let response = self.send(HttpRequest::get(self.dataset_url())).await?;
        if response.is_success() {
            debug!(dataset = %self.config.dataset_id, "dataset already exists");
            return Ok(());
        }
        if response.status != 404 {
            return Err(http_error(&response, "datasets.get"));
        }

        let mut resource = json!({
            "datasetReference": {
                "projectId": self.config.project_id,
                "datasetId": self.config.dataset_id,
            }
        });
        if let Some(location) = &self.config.location {
            resource["location"] = json!(location);
        }
        let url = format!("{}/datasets", self.project_url());
        let response = self.send(HttpRequest::post(url).json(resource)).await?;
        if response.status == 409 {
            return Ok(());
        }
        parse_api_response::<Value>(&response, "datasets.insert")?;
        info!(dataset = %self.config.dataset_id, "created dataset");
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let url = format!("{}/tables/{}", self.dataset_url(), table);
        let response = self.send(HttpRequest::get(url)).await?;
        match response.status {
            404 => Ok(false),
            _ if response.is_success() => Ok(true),
            _ => Err(http_error(&response, "tables.get")),
        }
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<CreateOutcome, StoreError> {
        let url = format!("{}/tables", self.dataset_url());
        let body = table_resource(&self.config, spec);
        let response = self.send(HttpRequest::post(url).json(body)).await?;
        if response.status == 409 {
            return Ok(CreateOutcome::AlreadyExists);
        }
        parse_api_response::<Value>(&response, "tables.insert")?;
        Ok(CreateOutcome::Created)
    }

    async fn delete_partition(
        &self,
        table: &str,
        date: NaiveDate,
        app_name: &str,
    ) -> Result<u64, StoreError> {
        let mut body = json!({
            "query": format!(
                "DELETE FROM {} WHERE date = @date AND app_name = @app_name",
                self.config.qualified_table(table)
            ),
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "queryParameters": [
                {
                    "name": "date",
                    "parameterType": { "type": "DATE" },
                    "parameterValue": { "value": date.format("%Y-%m-%d").to_string() },
                },
                {
                    "name": "app_name",
                    "parameterType": { "type": "STRING" },
                    "parameterValue": { "value": app_name },
                },
            ],
        });
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }
        let url = format!("{}/queries", self.project_url());
        let response = self.send(HttpRequest::post(url).json(body)).await?;
        let response: QueryResponse = parse_api_response(&response, "jobs.query")?;
        let response = self.poll_query(response).await?;

        let deleted = response
            .num_dml_affected_rows
            .as_deref()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        debug!(table, %date, app_name, deleted, "deleted partition slice");
        Ok(deleted)
    }

    async fn submit_load(
        &self,
        spec: &TableSpec,
        source: &Path,
        mode: WriteMode,
    ) -> Result<JobHandle, StoreError> {
        let data = tokio::fs::read(source).await?;
        let metadata = load_configuration(&self.config, spec, mode);
        let url = format!(
            "{}/projects/{}/jobs?uploadType=multipart",
            self.config.upload_base_url.trim_end_matches('/'),
            self.config.project_id
        );
        let request = HttpRequest::post(url).raw(
            format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            multipart_body(&metadata, &data),
        );
        let response = self.send(request).await?;
        let job: JobResource = parse_api_response(&response, "jobs.insert")?;
        debug!(table = %spec.name, job_id = %job.job_reference.job_id, "submitted load job");
        Ok(JobHandle {
            job_id: job.job_reference.job_id,
            location: job.job_reference.location,
        })
    }

    async fn wait_for_job(&self, job: &JobHandle) -> Result<(), StoreError> {
        let url = format!(
            "{}/jobs/{}{}",
            self.project_url(),
            job.job_id,
            self.location_query(job.location.as_deref())
        );
        loop {
            let response = self.send(HttpRequest::get(url.clone())).await?;
            let resource: JobResource = parse_api_response(&response, "jobs.get")?;
            let Some(status) = resource.status else {
                return Err(StoreError::UnexpectedShape {
                    operation: "jobs.get",
                    message: "job resource has no status".to_string(),
                });
            };
            if status.state == "DONE" {
                if let Some(error) = status.error_result {
                    return Err(StoreError::JobFailed {
                        job_id: job.job_id.clone(),
                        reason: format!("{}: {}", error.reason, error.message),
                    });
                }
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
