//! Configuration parsing and validation.
//!
//! Configuration is read from a YAML file after environment variable
//! interpolation (see [`vars`]).

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EmptySnapshotPathSnafu, EmptySourceUrlSnafu, EmptyWarehouseTargetSnafu,
    EnvInterpolationSnafu, MissingGcpConfigSnafu, ReadFileSnafu, UnsupportedPathSnafu,
    YamlParseSnafu,
};
use crate::source::DEFAULT_CATALOG_URL;
use crate::storage::BackendConfig;

/// Main configuration structure for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    pub snapshot: SnapshotConfig,
    pub warehouse: WarehouseConfig,
    /// Google Cloud project settings, needed for GCS and BigQuery destinations.
    #[serde(default)]
    pub gcp: Option<GcpConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Upstream catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Catalog endpoint answering with a JSON array of products.
    #[serde(default = "default_source_url")]
    pub url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
        }
    }
}

fn default_source_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

/// Snapshot destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Container URL, e.g. "gs://my-project-store-data" or "/var/lib/flurry/snapshots".
    pub path: String,

    /// Location used when the container has to be created (default: "US").
    #[serde(default = "default_location")]
    pub location: String,

    /// Storage options passed to the object store.
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Warehouse destination, selected by `backend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum WarehouseConfig {
    #[serde(rename = "bigquery")]
    BigQuery(BigQueryConfig),
    Delta(DeltaConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigQueryConfig {
    #[serde(default = "default_dataset")]
    pub dataset: String,

    #[serde(default = "default_location")]
    pub location: String,

    /// Delay between load job status polls (default: 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl BigQueryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Root under which each table is stored as `{path}/{table}`.
    pub path: String,

    /// Location used when a GCS bucket has to be created (default: "US").
    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

/// Google Cloud project and API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    pub project_id: String,

    /// Pre-minted OAuth access token. Falls back to `GOOGLE_OAUTH_ACCESS_TOKEN`
    /// and then to the metadata server.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_storage_endpoint")]
    pub storage_endpoint: String,

    #[serde(default = "default_bigquery_endpoint")]
    pub bigquery_endpoint: String,

    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the exporter is started (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_location() -> String {
    "US".to_string()
}

fn default_dataset() -> String {
    "store_data".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_storage_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_bigquery_endpoint() -> String {
    "https://bigquery.googleapis.com".to_string()
}

fn default_metadata_endpoint() -> String {
    "http://metadata.google.internal".to_string()
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn check_path(field: &'static str, url: &str) -> Result<(), ConfigError> {
    ensure!(
        BackendConfig::parse_url(url).is_ok(),
        UnsupportedPathSnafu { field, url }
    );
    Ok(())
}

fn is_gcs(url: &str) -> bool {
    matches!(BackendConfig::parse_url(url), Ok(BackendConfig::Gcs(_)))
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            let result = vars::interpolate(content);
            if !result.is_ok() {
                return EnvInterpolationSnafu {
                    message: result.errors.join("\n"),
                }
                .fail();
            }
            result.text
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.source.url.trim().is_empty(), EmptySourceUrlSnafu);
        ensure!(!self.snapshot.path.trim().is_empty(), EmptySnapshotPathSnafu);
        check_path("snapshot path", &self.snapshot.path)?;

        match &self.warehouse {
            WarehouseConfig::BigQuery(bq) => {
                ensure!(
                    !bq.dataset.trim().is_empty(),
                    EmptyWarehouseTargetSnafu { field: "dataset" }
                );
            }
            WarehouseConfig::Delta(delta) => {
                ensure!(
                    !delta.path.trim().is_empty(),
                    EmptyWarehouseTargetSnafu { field: "path" }
                );
                check_path("warehouse path", &delta.path)?;
            }
        }

        let reason = if matches!(self.warehouse, WarehouseConfig::BigQuery(_)) {
            Some("the bigquery warehouse backend is configured")
        } else if is_gcs(&self.snapshot.path) {
            Some("the snapshot path is a GCS bucket")
        } else if matches!(&self.warehouse, WarehouseConfig::Delta(d) if is_gcs(&d.path)) {
            Some("the delta warehouse path is a GCS bucket")
        } else {
            None
        };

        if let Some(reason) = reason {
            let has_project = self
                .gcp
                .as_ref()
                .is_some_and(|gcp| !gcp.project_id.trim().is_empty());
            ensure!(has_project, MissingGcpConfigSnafu { reason });
        }

        Ok(())
    }
}
