//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a run. Events
//! implement the `InternalEvent` trait which records the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::error::ErrorKind;
use crate::transform::ProjectionName;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Extract & transform events
// ============================================================================

/// Event emitted when the catalog has been fetched.
pub struct CatalogItemsFetched {
    pub count: u64,
}

impl InternalEvent for CatalogItemsFetched {
    fn emit(self) {
        trace!(count = self.count, "Catalog items fetched");
        counter!("flurry_catalog_items_fetched_total").increment(self.count);
        gauge!("flurry_catalog_items").set(self.count as f64);
    }
}

/// Event emitted when the catalog request completes.
pub struct CatalogFetchCompleted {
    pub duration: Duration,
}

impl InternalEvent for CatalogFetchCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Catalog fetch completed"
        );
        histogram!("flurry_catalog_fetch_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted for each projection produced by the transformer.
pub struct ProjectionShaped {
    pub projection: ProjectionName,
    pub records: u64,
}

impl InternalEvent for ProjectionShaped {
    fn emit(self) {
        trace!(
            projection = self.projection.as_str(),
            records = self.records,
            "Projection shaped"
        );
        counter!(
            "flurry_projection_records_total",
            "projection" => self.projection.as_str()
        )
        .increment(self.records);
    }
}

// ============================================================================
// Sink events
// ============================================================================

/// Event emitted when a snapshot document has been written.
pub struct SnapshotPublished {
    pub projection: ProjectionName,
    pub bytes: u64,
}

impl InternalEvent for SnapshotPublished {
    fn emit(self) {
        trace!(
            projection = self.projection.as_str(),
            bytes = self.bytes,
            "Snapshot published"
        );
        counter!(
            "flurry_snapshots_published_total",
            "projection" => self.projection.as_str()
        )
        .increment(1);
        counter!("flurry_snapshot_bytes_written_total").increment(self.bytes);
    }
}

/// Event emitted when a warehouse load job reaches a successful terminal state.
pub struct WarehouseLoadCompleted {
    pub projection: ProjectionName,
    pub rows: u64,
    pub duration: Duration,
}

impl InternalEvent for WarehouseLoadCompleted {
    fn emit(self) {
        trace!(
            projection = self.projection.as_str(),
            rows = self.rows,
            duration_ms = self.duration.as_millis(),
            "Warehouse load completed"
        );
        counter!(
            "flurry_warehouse_rows_loaded_total",
            "projection" => self.projection.as_str()
        )
        .increment(self.rows);
        histogram!(
            "flurry_warehouse_load_duration_seconds",
            "projection" => self.projection.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Kind of destination resource checked before writing.
#[derive(Debug, Clone, Copy)]
pub enum ResourceKind {
    Container,
    Dataset,
}

impl ResourceKind {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Container => "container",
            ResourceKind::Dataset => "dataset",
        }
    }
}

/// Event emitted when a destination container or dataset is ensured.
pub struct ResourceProvisioned {
    pub kind: ResourceKind,
    pub outcome: &'static str,
}

impl InternalEvent for ResourceProvisioned {
    fn emit(self) {
        trace!(
            kind = self.kind.as_str(),
            outcome = self.outcome,
            "Resource provisioned"
        );
        counter!(
            "flurry_resources_provisioned_total",
            "kind" => self.kind.as_str(),
            "outcome" => self.outcome
        )
        .increment(1);
    }
}

// ============================================================================
// Storage events
// ============================================================================

/// Status of a storage write.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when an object write completes.
pub struct StorageWrite {
    pub status: RequestStatus,
}

impl InternalEvent for StorageWrite {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Storage write");
        counter!("flurry_storage_writes_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted with the duration of an object write.
pub struct StorageWriteDuration {
    pub duration: Duration,
}

impl InternalEvent for StorageWriteDuration {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Storage write duration"
        );
        histogram!("flurry_storage_write_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Run events
// ============================================================================

/// Terminal status of a run.
#[derive(Debug, Clone, Copy)]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// Event emitted when a run reaches `Done` or `Failed`.
pub struct RunCompleted {
    pub status: RunStatus,
    /// Classification of the failure, for failed runs.
    pub error_kind: Option<ErrorKind>,
    pub duration: Duration,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Run completed"
        );
        counter!("flurry_runs_total", "status" => self.status.as_str()).increment(1);
        if let Some(kind) = self.error_kind {
            counter!("flurry_run_failures_total", "kind" => kind.as_str()).increment(1);
        }
        histogram!("flurry_run_duration_seconds").record(self.duration.as_secs_f64());
    }
}
