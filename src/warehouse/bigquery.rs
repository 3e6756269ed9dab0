//! BigQuery warehouse backend.
//!
//! Tables are replaced with `WRITE_TRUNCATE` load jobs uploaded through the
//! multipart `jobs.insert` endpoint, with schema auto-detection.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{JobStatus, LoadJob, LoadRequest, Warehouse};
use crate::error::{
    CreateRemoteSnafu, JobPollSnafu, LoadJobFailedSnafu, LoadSubmitSnafu, LookupSnafu,
    ProvisionError, WarehouseError,
};
use crate::gcp::GcpClient;
use crate::metrics::events::ResourceKind;
use crate::storage::provision::{self, CONFLICT, Provisioned, Provisioner};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    status: Option<JobState>,
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobState {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

// int64 values come back as JSON strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

impl JobResource {
    fn status(&self) -> JobStatus {
        let Some(state) = &self.status else {
            return JobStatus::Pending;
        };

        match state.state.as_str() {
            "DONE" => match &state.error_result {
                Some(error) => JobStatus::Failed {
                    message: match (&error.reason, &error.message) {
                        (Some(reason), Some(message)) => format!("{reason}: {message}"),
                        (None, Some(message)) => message.clone(),
                        (Some(reason), None) => reason.clone(),
                        (None, None) => "load job failed".to_string(),
                    },
                },
                None => JobStatus::Succeeded {
                    rows: self
                        .statistics
                        .as_ref()
                        .and_then(|s| s.load.as_ref())
                        .and_then(|l| l.output_rows.as_deref())
                        .and_then(|r| r.parse().ok())
                        .unwrap_or_default(),
                },
            },
            "RUNNING" => JobStatus::Running,
            _ => JobStatus::Pending,
        }
    }

    fn into_job(self) -> LoadJob {
        let status = self.status();
        LoadJob {
            id: self.job_reference.job_id,
            location: self.job_reference.location,
            status,
        }
    }
}

/// A BigQuery dataset, created through the REST API.
#[derive(Debug)]
pub struct BigQueryDataset {
    client: Arc<GcpClient>,
    dataset: String,
    location: String,
}

impl BigQueryDataset {
    fn datasets_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets",
            self.client.bigquery_endpoint(),
            self.client.project_id()
        )
    }
}

#[async_trait]
impl Provisioner for BigQueryDataset {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Dataset
    }

    fn resource(&self) -> String {
        format!("dataset {}.{}", self.client.project_id(), self.dataset)
    }

    async fn lookup(&self) -> Result<bool, ProvisionError> {
        let url = format!("{}/{}", self.datasets_url(), self.dataset);
        let found: Option<serde_json::Value> =
            self.client.get_json(&url).await.context(LookupSnafu {
                resource: self.resource(),
            })?;
        Ok(found.is_some())
    }

    async fn create(&self) -> Result<Provisioned, ProvisionError> {
        let body = json!({
            "datasetReference": {
                "projectId": self.client.project_id(),
                "datasetId": self.dataset,
            },
            "location": self.location,
        });

        match self
            .client
            .post_json::<_, serde_json::Value>(&self.datasets_url(), &body)
            .await
        {
            Ok(_) => {
                info!("Created dataset {} in {}", self.dataset, self.location);
                Ok(Provisioned::Created)
            }
            Err(e) if e.status() == Some(CONFLICT) => Ok(Provisioned::AlreadyExists),
            Err(source) => Err(source).context(CreateRemoteSnafu {
                resource: self.resource(),
            }),
        }
    }
}

/// Loads projections into BigQuery tables.
#[derive(Debug)]
pub struct BigQueryWarehouse {
    client: Arc<GcpClient>,
    dataset: BigQueryDataset,
    poll_interval: Duration,
}

impl BigQueryWarehouse {
    pub fn new(
        client: Arc<GcpClient>,
        dataset: impl Into<String>,
        location: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            dataset: BigQueryDataset {
                client: client.clone(),
                dataset: dataset.into(),
                location: location.into(),
            },
            client,
            poll_interval,
        }
    }

    fn load_metadata(&self, table: &str) -> serde_json::Value {
        let project = self.client.project_id();
        json!({
            "jobReference": {
                "projectId": project,
                "jobId": format!("flurry_{}_{}", table, Uuid::new_v4().simple()),
                "location": self.dataset.location,
            },
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": project,
                        "datasetId": self.dataset.dataset,
                        "tableId": table,
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_TRUNCATE",
                    "createDisposition": "CREATE_IF_NEEDED",
                    "autodetect": true,
                }
            }
        })
    }
}

/// Assemble a `multipart/related` body of JSON metadata followed by the data.
fn multipart_related(boundary: &str, metadata: &serde_json::Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 1024);
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(
        format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn dataset(&self) -> String {
        self.dataset.dataset.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn ensure_dataset(&self) -> Result<Provisioned, ProvisionError> {
        provision::ensure(&self.dataset).await
    }

    async fn submit_load(&self, request: LoadRequest) -> Result<LoadJob, WarehouseError> {
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.client.bigquery_endpoint(),
            self.client.project_id()
        );
        let boundary = Uuid::new_v4().simple().to_string();
        let body = multipart_related(&boundary, &self.load_metadata(&request.table), &request.rows);

        debug!(
            "Submitting load of {} rows ({} bytes) into {}",
            request.row_count,
            request.rows.len(),
            request.table
        );
        let job: JobResource = self
            .client
            .post_bytes(
                &url,
                &format!("multipart/related; boundary={boundary}"),
                body,
            )
            .await
            .context(LoadSubmitSnafu {
                table: &request.table,
            })?;

        Ok(job.into_job())
    }

    async fn poll_job(&self, table: &str, job: &LoadJob) -> Result<JobStatus, WarehouseError> {
        let mut url = format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.client.bigquery_endpoint(),
            self.client.project_id(),
            job.id
        );
        if let Some(location) = &job.location {
            url = format!("{url}?location={location}");
        }

        let resource: Option<JobResource> =
            self.client.get_json(&url).await.context(JobPollSnafu {
                table,
                job_id: &job.id,
            })?;

        match resource {
            Some(resource) => Ok(resource.status()),
            None => LoadJobFailedSnafu {
                table,
                job_id: &job.id,
                message: "job not found",
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::gcp::tests::{serve, test_client};
    use crate::source::parse_catalog;
    use crate::transform::shape;
    use crate::warehouse::WarehouseSink;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBigQuery {
        datasets: Mutex<Vec<serde_json::Value>>,
        uploads: Mutex<Vec<(String, String)>>,
        polls: Mutex<usize>,
        fail_table: Option<&'static str>,
    }

    fn router(state: Arc<FakeBigQuery>) -> Router {
        Router::new()
            .route(
                "/bigquery/v2/projects/demo-project/datasets/store_data",
                get(|State(state): State<Arc<FakeBigQuery>>| async move {
                    if state.datasets.lock().unwrap().is_empty() {
                        (StatusCode::NOT_FOUND, "{}".to_string())
                    } else {
                        (StatusCode::OK, "{\"id\":\"store_data\"}".to_string())
                    }
                }),
            )
            .route(
                "/bigquery/v2/projects/demo-project/datasets",
                post(
                    |State(state): State<Arc<FakeBigQuery>>,
                     axum::Json(body): axum::Json<serde_json::Value>| async move {
                        state.datasets.lock().unwrap().push(body.clone());
                        axum::Json(body)
                    },
                ),
            )
            .route(
                "/upload/bigquery/v2/projects/demo-project/jobs",
                post(
                    |State(state): State<Arc<FakeBigQuery>>, headers: HeaderMap, body: String| async move {
                        let content_type = headers
                            .get("content-type")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let table = if body.contains("\"tableId\":\"sales_products\"") {
                            "sales_products"
                        } else if body.contains("\"tableId\":\"product_products\"") {
                            "product_products"
                        } else {
                            "finance_products"
                        };
                        state
                            .uploads
                            .lock()
                            .unwrap()
                            .push((content_type, body.clone()));
                        axum::Json(json!({
                            "jobReference": { "jobId": format!("job_{table}"), "location": "US" },
                            "status": { "state": "RUNNING" }
                        }))
                    },
                ),
            )
            .route(
                "/bigquery/v2/projects/demo-project/jobs/{job_id}",
                get(
                    |State(state): State<Arc<FakeBigQuery>>, Path(job_id): Path<String>| async move {
                        *state.polls.lock().unwrap() += 1;
                        let failed = state
                            .fail_table
                            .is_some_and(|t| job_id == format!("job_{t}"));
                        let status = if failed {
                            json!({
                                "state": "DONE",
                                "errorResult": { "reason": "invalid", "message": "Schema mismatch" }
                            })
                        } else {
                            json!({ "state": "DONE" })
                        };
                        axum::Json(json!({
                            "jobReference": { "jobId": job_id, "location": "US" },
                            "status": status,
                            "statistics": { "load": { "outputRows": "1" } }
                        }))
                    },
                ),
            )
            .with_state(state)
    }

    async fn warehouse(state: Arc<FakeBigQuery>) -> BigQueryWarehouse {
        let base = serve(router(state)).await;
        BigQueryWarehouse::new(
            Arc::new(test_client(&base)),
            "store_data",
            "US",
            Duration::from_millis(1),
        )
    }

    const SHIRT: &[u8] = br#"[{"id":1,"title":"Shirt","price":19.99,"category":"clothing",
        "description":"desc","image":"img.jpg","rating":{"rate":4.2}}]"#;

    #[test]
    fn test_job_status_mapping() {
        let job: JobResource = serde_json::from_value(json!({
            "jobReference": { "jobId": "j1" },
            "status": { "state": "DONE" },
            "statistics": { "load": { "outputRows": "20" } }
        }))
        .unwrap();
        assert_eq!(job.status(), JobStatus::Succeeded { rows: 20 });

        let job: JobResource = serde_json::from_value(json!({
            "jobReference": { "jobId": "j2" },
            "status": { "state": "DONE", "errorResult": { "message": "Bad row" } }
        }))
        .unwrap();
        assert_eq!(
            job.status(),
            JobStatus::Failed {
                message: "Bad row".to_string()
            }
        );

        let job: JobResource = serde_json::from_value(json!({
            "jobReference": { "jobId": "j3" },
            "status": { "state": "PENDING" }
        }))
        .unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_related("b0", &json!({ "a": 1 }), b"{\"x\":1}");
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "--b0\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{\"a\":1}\r\n\
             --b0\r\nContent-Type: application/octet-stream\r\n\r\n{\"x\":1}\r\n--b0--\r\n"
        );
    }

    #[tokio::test]
    async fn test_load_creates_dataset_and_truncates_tables() {
        let state = Arc::new(FakeBigQuery::default());
        let sink = WarehouseSink::new(Arc::new(warehouse(state.clone()).await));

        let report = sink
            .load(&shape(&parse_catalog(SHIRT).unwrap()))
            .await
            .unwrap();

        assert_eq!(report.len(), 3);
        assert_eq!(report.tables[0].job_id, "job_sales_products");
        assert_eq!(report.tables[0].rows, 1);

        // Created once, then found by the later lookups.
        let datasets = state.datasets.lock().unwrap();
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0]["datasetReference"]["datasetId"], "store_data");
        assert_eq!(datasets[0]["location"], "US");

        let uploads = state.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 3);
        let (content_type, body) = &uploads[0];
        assert!(content_type.starts_with("multipart/related; boundary="));
        assert!(body.contains("\"writeDisposition\":\"WRITE_TRUNCATE\""));
        assert!(body.contains("\"sourceFormat\":\"NEWLINE_DELIMITED_JSON\""));
        assert!(body.contains("\"autodetect\":true"));
        assert!(body.contains("{\"title\":\"Shirt\",\"price\":19.99,\"category\":\"clothing\"}"));
        assert_eq!(*state.polls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_job_stops_load() {
        let state = Arc::new(FakeBigQuery {
            fail_table: Some("product_products"),
            ..Default::default()
        });
        let sink = WarehouseSink::new(Arc::new(warehouse(state.clone()).await));

        let err = sink
            .load(&shape(&parse_catalog(SHIRT).unwrap()))
            .await
            .unwrap_err();

        assert_eq!(err.source.kind(), ErrorKind::SinkWriteFailure);
        assert!(err.source.to_string().contains("invalid: Schema mismatch"));
        assert_eq!(err.loaded.len(), 1);
        assert_eq!(state.uploads.lock().unwrap().len(), 2);
    }

    /// A dataset API whose lookups fail and whose creates answer `create_status`.
    async fn flaky_datasets(create_status: StatusCode) -> BigQueryWarehouse {
        let router = Router::new()
            .route(
                "/bigquery/v2/projects/demo-project/datasets/store_data",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "backend error") }),
            )
            .route(
                "/bigquery/v2/projects/demo-project/datasets",
                post(move || async move { (create_status, "{\"error\":{}}") }),
            );
        let base = serve(router).await;
        BigQueryWarehouse::new(
            Arc::new(test_client(&base)),
            "store_data",
            "US",
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_dataset_conflict_after_failed_lookup_is_accepted() {
        let warehouse = flaky_datasets(StatusCode::CONFLICT).await;

        let outcome = warehouse.ensure_dataset().await.unwrap();

        assert_eq!(outcome, Provisioned::AlreadyExists);
    }

    #[tokio::test]
    async fn test_dataset_create_rejection_is_reported() {
        let warehouse = flaky_datasets(StatusCode::FORBIDDEN).await;

        let err = warehouse.ensure_dataset().await.unwrap_err();

        assert!(matches!(err, ProvisionError::CreateRemote { .. }));
        assert!(err.to_string().contains("dataset demo-project.store_data"));
    }
}
