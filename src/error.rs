//! Error types for Flurry using snafu.
//!
//! Each component has its own error enum with context selectors. Run
//! failures are classified into the [`ErrorKind`] taxonomy through
//! [`PipelineError::kind`], and sink failures carry the report of the writes
//! that had already committed.

use snafu::prelude::*;

use crate::pipeline::RunState;
use crate::snapshot::PublishReport;
use crate::transform::ProjectionName;
use crate::warehouse::LoadReport;

/// Classification of run failures exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The catalog could not be fetched (transport error or non-200 status).
    SourceUnavailable,
    /// The catalog payload did not parse as a sequence of catalog records.
    SourceMalformed,
    /// A destination container or dataset could not be looked up or created.
    DestinationProvisionFailure,
    /// A snapshot write or warehouse load failed.
    SinkWriteFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::SourceMalformed => "source_malformed",
            ErrorKind::DestinationProvisionFailure => "destination_provision_failure",
            ErrorKind::SinkWriteFailure => "sink_write_failure",
        }
    }
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error"))]
    GcsConfig { source: object_store::Error },
}

// ============ Google Cloud API Errors ============

/// Errors returned by the Google Cloud REST helpers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GcpError {
    /// The HTTP request could not be sent or its body could not be read.
    #[snafu(display("Request to {url} failed"))]
    ApiRequest { url: String, source: reqwest::Error },

    /// The API answered with a non-success status.
    #[snafu(display("{url} returned HTTP {status}: {body}"))]
    ApiStatus {
        url: String,
        status: u16,
        body: String,
    },

    /// The API answered with a body that could not be decoded.
    #[snafu(display("Unexpected response body from {url}"))]
    ApiDecode {
        url: String,
        source: serde_json::Error,
    },

    /// No access token could be obtained.
    #[snafu(display("Failed to obtain access token: {message}"))]
    Token { message: String },
}

impl GcpError {
    /// HTTP status reported by the API, if the request got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            GcpError::ApiStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ============ Provisioning Errors ============

/// Errors raised while making sure a destination container or dataset exists.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProvisionError {
    /// Looking up a remote resource failed.
    #[snafu(display("Failed to look up {resource}"))]
    Lookup { resource: String, source: GcpError },

    /// Local directory creation failed.
    #[snafu(display("Failed to create directory {path}"))]
    CreateDirectory {
        path: String,
        source: std::io::Error,
    },

    /// Remote resource creation failed for a reason other than "already exists".
    #[snafu(display("Failed to create {resource}"))]
    CreateRemote { resource: String, source: GcpError },
}

// ============ Extract Errors ============

/// Errors that can occur while fetching the catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExtractError {
    /// The upstream answered with a non-success status.
    #[snafu(display("Catalog source {url} unavailable: HTTP {status}"))]
    SourceUnavailable { url: String, status: u16 },

    /// The request never produced a complete response.
    #[snafu(display("Catalog request to {url} failed"))]
    SourceRequest { url: String, source: reqwest::Error },

    /// The response body is not a sequence of catalog records.
    #[snafu(display("Catalog payload from {url} is malformed"))]
    SourceMalformed {
        url: String,
        source: serde_json::Error,
    },
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::SourceUnavailable { .. } | ExtractError::SourceRequest { .. } => {
                ErrorKind::SourceUnavailable
            }
            ExtractError::SourceMalformed { .. } => ErrorKind::SourceMalformed,
        }
    }

    /// HTTP status observed from the upstream, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ExtractError::SourceUnavailable { status, .. } => Some(*status),
            ExtractError::SourceRequest { source, .. } => source.status().map(|s| s.as_u16()),
            ExtractError::SourceMalformed { .. } => None,
        }
    }
}

// ============ Snapshot Errors ============

/// Errors that can occur while publishing a snapshot.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SnapshotError {
    /// The snapshot container could not be provisioned.
    #[snafu(display("Snapshot container {container} unavailable"))]
    ContainerProvision {
        container: String,
        source: ProvisionError,
    },

    /// A projection could not be rendered as JSON.
    #[snafu(display("Failed to serialize {projection} snapshot"))]
    SnapshotSerialize {
        projection: ProjectionName,
        source: serde_json::Error,
    },

    /// The snapshot document could not be written.
    #[snafu(display("Failed to write snapshot {key}"))]
    SnapshotWrite { key: String, source: StorageError },
}

impl SnapshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::ContainerProvision { .. } => ErrorKind::DestinationProvisionFailure,
            SnapshotError::SnapshotSerialize { .. } | SnapshotError::SnapshotWrite { .. } => {
                ErrorKind::SinkWriteFailure
            }
        }
    }
}

/// A snapshot failure along with the snapshots that were already written.
#[derive(Debug, Snafu)]
#[snafu(
    visibility(pub),
    display(
        "Snapshot publish stopped after {} of {} projections",
        published.len(),
        ProjectionName::ALL.len()
    )
)]
pub struct PublishError {
    pub published: PublishReport,
    pub source: SnapshotError,
}

// ============ Delta Errors ============

/// Errors that can occur in the Delta Lake warehouse backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeltaError {
    /// Arrow could not infer a schema from the rows.
    #[snafu(display("Schema inference failed: {message}"))]
    SchemaInference { message: String },

    /// Arrow could not decode the rows with the inferred schema.
    #[snafu(display("Failed to decode rows: {message}"))]
    RecordDecode { message: String },

    /// Failed to create struct type.
    #[snafu(display("Failed to create struct type: {message}"))]
    StructType { message: String },

    /// Arrow type without a Delta equivalent.
    #[snafu(display("Unsupported Arrow type: {arrow_type:?}"))]
    UnsupportedArrowType {
        arrow_type: deltalake::arrow::datatypes::DataType,
    },

    /// Parquet write error.
    #[snafu(display("Parquet write error"))]
    ParquetWrite {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Uploading the data file failed.
    #[snafu(display("Failed to upload data file"))]
    DeltaUpload { source: StorageError },

    /// Delta Lake operation failed.
    #[snafu(display("Delta Lake operation failed"))]
    DeltaLake { source: deltalake::DeltaTableError },

    /// Failed to parse URL.
    #[snafu(display("Failed to parse URL"))]
    UrlParse { source: url::ParseError },
}

// ============ Warehouse Errors ============

/// Errors that can occur while loading a table into the warehouse.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// The dataset could not be provisioned.
    #[snafu(display("Dataset {dataset} unavailable"))]
    DatasetProvision {
        dataset: String,
        source: ProvisionError,
    },

    /// Rows could not be encoded as NDJSON.
    #[snafu(display("Failed to encode rows for {table}"))]
    RowEncode {
        table: String,
        source: serde_json::Error,
    },

    /// The load job could not be submitted.
    #[snafu(display("Failed to submit load job for {table}"))]
    LoadSubmit { table: String, source: GcpError },

    /// The load job status could not be read.
    #[snafu(display("Failed to poll load job {job_id} for {table}"))]
    JobPoll {
        table: String,
        job_id: String,
        source: GcpError,
    },

    /// The warehouse reported the load job as failed.
    #[snafu(display("Load job {job_id} for {table} failed: {message}"))]
    LoadJobFailed {
        table: String,
        job_id: String,
        message: String,
    },

    /// The Delta Lake backend failed to replace the table.
    #[snafu(display("Failed to replace Delta table {table}"))]
    DeltaLoad { table: String, source: DeltaError },
}

impl WarehouseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarehouseError::DatasetProvision { .. } => ErrorKind::DestinationProvisionFailure,
            _ => ErrorKind::SinkWriteFailure,
        }
    }
}

/// A warehouse failure along with the tables that were already replaced.
#[derive(Debug, Snafu)]
#[snafu(
    visibility(pub),
    display(
        "Warehouse load stopped after {} of {} tables",
        loaded.len(),
        ProjectionName::ALL.len()
    )
)]
pub struct LoadError {
    pub loaded: LoadReport,
    pub source: WarehouseError,
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Source URL is empty.
    #[snafu(display("Source URL cannot be empty"))]
    EmptySourceUrl,

    /// Snapshot path is empty.
    #[snafu(display("Snapshot path cannot be empty"))]
    EmptySnapshotPath,

    /// Warehouse dataset or path is empty.
    #[snafu(display("Warehouse {field} cannot be empty"))]
    EmptyWarehouseTarget { field: &'static str },

    /// A storage path is not a GCS URL or a local path.
    #[snafu(display("Unsupported {field} '{url}': expected gs://, file:// or a local path"))]
    UnsupportedPath { field: &'static str, url: String },

    /// A `gcp` section is needed for the configured destinations.
    #[snafu(display("A gcp section with a project_id is required: {reason}"))]
    MissingGcpConfig { reason: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level errors returned to the entry point.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Storage could not be set up.
    #[snafu(display("Storage setup failed"))]
    Setup { source: StorageError },

    /// The HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client"))]
    HttpClient { source: reqwest::Error },

    /// Extraction failed.
    #[snafu(display("Extraction failed"))]
    Extract { source: ExtractError },

    /// Publishing snapshots failed.
    #[snafu(display("Snapshot publish failed"))]
    Snapshot { source: PublishError },

    /// Loading the warehouse failed after all snapshots were published.
    #[snafu(display("Warehouse load failed"))]
    Warehouse {
        published: PublishReport,
        source: LoadError,
    },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// The trigger server failed.
    #[snafu(display("Trigger server failed"))]
    Serve { source: std::io::Error },
}

impl PipelineError {
    /// Classify a run failure. Returns `None` for failures outside a run
    /// (configuration, setup, serving).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::Extract { source } => Some(source.kind()),
            PipelineError::Snapshot { source } => Some(source.source.kind()),
            PipelineError::Warehouse { source, .. } => Some(source.source.kind()),
            _ => None,
        }
    }

    /// The run state that was active when the run failed.
    pub fn stage(&self) -> Option<RunState> {
        match self {
            PipelineError::Extract { .. } => Some(RunState::Extracting),
            PipelineError::Snapshot { .. } => Some(RunState::SnapshotLoading),
            PipelineError::Warehouse { .. } => Some(RunState::WarehouseLoading),
            _ => None,
        }
    }

    /// Snapshots that were durably written before the failure.
    pub fn published(&self) -> Option<&PublishReport> {
        match self {
            PipelineError::Snapshot { source } => Some(&source.published),
            PipelineError::Warehouse { published, .. } => Some(published),
            _ => None,
        }
    }

    /// Warehouse tables that were replaced before the failure.
    pub fn loaded(&self) -> Option<&LoadReport> {
        match self {
            PipelineError::Warehouse { source, .. } => Some(&source.loaded),
            _ => None,
        }
    }

    /// The full error chain joined into one line.
    pub fn message(&self) -> String {
        let mut message = self.to_string();
        let mut current = std::error::Error::source(self);
        while let Some(cause) = current {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            current = std::error::Error::source(cause);
        }
        message
    }
}
