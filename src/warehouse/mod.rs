//! Warehouse sink.
//!
//! Each projection is loaded as a truncate-and-replace of its table. For every
//! projection the sink makes sure the dataset exists, encodes the rows as
//! NDJSON, submits a load job and blocks until the job is terminal before
//! moving to the next projection.

pub mod bigquery;
pub mod delta;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::emit;
use crate::error::{
    DatasetProvisionSnafu, LoadError, LoadJobFailedSnafu, ProvisionError, RowEncodeSnafu,
    WarehouseError,
};
use crate::metrics::events::WarehouseLoadCompleted;
use crate::storage::provision::Provisioned;
use crate::transform::{Projection, ProjectionName, ProjectionSet};

pub use bigquery::BigQueryWarehouse;
pub use delta::DeltaWarehouse;

/// State of a submitted load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { rows: u64 },
    Failed { message: String },
}

/// Handle to a submitted load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub id: String,
    pub location: Option<String>,
    pub status: JobStatus,
}

/// Rows of one projection ready to be loaded.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub projection: ProjectionName,
    pub table: String,
    /// Newline-delimited JSON, one row per line.
    pub rows: Bytes,
    pub row_count: u64,
}

/// A tabular warehouse that replaces whole tables through load jobs.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Dataset (or table root) holding the projection tables.
    fn dataset(&self) -> String;

    /// Delay between job status polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Make sure the dataset exists, creating it when missing.
    async fn ensure_dataset(&self) -> Result<Provisioned, ProvisionError>;

    /// Submit a truncate-and-replace load of `request.table`.
    async fn submit_load(&self, request: LoadRequest) -> Result<LoadJob, WarehouseError>;

    /// Current status of a submitted job.
    async fn poll_job(&self, table: &str, job: &LoadJob) -> Result<JobStatus, WarehouseError>;
}

/// One table that was replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTable {
    pub projection: ProjectionName,
    pub table: String,
    pub job_id: String,
    pub rows: u64,
}

/// Tables replaced by one load call, in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub tables: Vec<LoadedTable>,
}

impl LoadReport {
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, projection: ProjectionName) -> bool {
        self.tables.iter().any(|t| t.projection == projection)
    }
}

/// Loads every projection into its warehouse table.
pub struct WarehouseSink {
    warehouse: Arc<dyn Warehouse>,
}

impl WarehouseSink {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub fn dataset(&self) -> String {
        self.warehouse.dataset()
    }

    /// Replace the table of every projection.
    pub async fn load(&self, projections: &ProjectionSet) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();

        for (name, projection) in projections.iter() {
            match self.load_projection(name, projection).await {
                Ok(table) => {
                    info!(
                        "Loaded {} rows into {}.{}",
                        table.rows,
                        self.warehouse.dataset(),
                        table.table
                    );
                    report.tables.push(table);
                }
                Err(source) => {
                    return Err(LoadError {
                        loaded: report,
                        source,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn load_projection(
        &self,
        name: ProjectionName,
        projection: Projection<'_>,
    ) -> Result<LoadedTable, WarehouseError> {
        let table = name.table_name();

        self.warehouse
            .ensure_dataset()
            .await
            .context(DatasetProvisionSnafu {
                dataset: self.warehouse.dataset(),
            })?;

        let rows = projection
            .to_ndjson()
            .context(RowEncodeSnafu { table: &table })?;

        let start = Instant::now();
        let job = self
            .warehouse
            .submit_load(LoadRequest {
                projection: name,
                table: table.clone(),
                rows: Bytes::from(rows),
                row_count: projection.len() as u64,
            })
            .await?;
        debug!("Submitted load job {} for {}", job.id, table);

        let rows = self.wait(&table, &job).await?;
        emit!(WarehouseLoadCompleted {
            projection: name,
            rows,
            duration: start.elapsed(),
        });

        Ok(LoadedTable {
            projection: name,
            table,
            job_id: job.id,
            rows,
        })
    }

    /// Poll until the job is terminal. Returns the loaded row count.
    async fn wait(&self, table: &str, job: &LoadJob) -> Result<u64, WarehouseError> {
        let mut status = job.status.clone();
        loop {
            match status {
                JobStatus::Succeeded { rows } => return Ok(rows),
                JobStatus::Failed { message } => {
                    return LoadJobFailedSnafu {
                        table,
                        job_id: &job.id,
                        message,
                    }
                    .fail();
                }
                JobStatus::Pending | JobStatus::Running => {
                    tokio::time::sleep(self.warehouse.poll_interval()).await;
                    status = self.warehouse.poll_job(table, job).await?;
                }
            }
        }
    }
}
