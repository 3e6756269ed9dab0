//! Run orchestration.
//!
//! A run walks `Idle → Extracting → Transforming → SnapshotLoading →
//! WarehouseLoading → Done`, strictly in sequence. The first error moves the
//! run to `Failed` and is returned to the caller unchanged; nothing already
//! written is rolled back.

use snafu::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, WarehouseConfig};
use crate::emit;
use crate::error::{
    ConfigSnafu, ExtractSnafu, HttpClientSnafu, MissingGcpConfigSnafu, PipelineError, SetupSnafu,
    SnapshotSnafu,
};
use crate::gcp::GcpClient;
use crate::metrics::events::{RunCompleted, RunStatus};
use crate::snapshot::{PublishReport, SnapshotSink};
use crate::source::{CatalogSource, HttpCatalogSource};
use crate::storage::StorageProvider;
use crate::storage::provision;
use crate::transform;
use crate::types::RunDate;
use crate::warehouse::{
    BigQueryWarehouse, DeltaWarehouse, LoadReport, Warehouse, WarehouseSink,
};

/// State of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    SnapshotLoading,
    WarehouseLoading,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Extracting => "extracting",
            RunState::Transforming => "transforming",
            RunState::SnapshotLoading => "snapshot_loading",
            RunState::WarehouseLoading => "warehouse_loading",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_date: RunDate,
    /// Number of catalog items fetched.
    pub items: usize,
    pub published: PublishReport,
    pub loaded: LoadReport,
    pub duration: Duration,
}

/// Extract → transform → snapshot → warehouse.
pub struct Pipeline {
    source: Arc<dyn CatalogSource>,
    snapshots: SnapshotSink,
    warehouse: WarehouseSink,
    state: RunState,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        snapshots: SnapshotSink,
        warehouse: WarehouseSink,
    ) -> Self {
        Self {
            source,
            snapshots,
            warehouse,
            state: RunState::Idle,
        }
    }

    /// Wire up the collaborators described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("flurry/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(HttpClientSnafu)?;
        let gcp = config
            .gcp
            .as_ref()
            .map(|gcp| Arc::new(GcpClient::new(http.clone(), gcp)));

        let source = Arc::new(HttpCatalogSource::new(http, config.source.url.clone()));

        let storage = StorageProvider::for_url_with_options(
            &config.snapshot.path,
            config.snapshot.storage_options.clone(),
        )
        .await
        .context(SetupSnafu)?;
        let container = provision::for_storage(&storage, gcp.clone(), &config.snapshot.location)
            .context(ConfigSnafu)?;
        let snapshots = SnapshotSink::new(Arc::new(storage), container);

        let warehouse: Arc<dyn Warehouse> = match &config.warehouse {
            WarehouseConfig::BigQuery(bq) => {
                let client = gcp
                    .context(MissingGcpConfigSnafu {
                        reason: "the bigquery warehouse backend is configured",
                    })
                    .context(ConfigSnafu)?;
                Arc::new(BigQueryWarehouse::new(
                    client,
                    bq.dataset.clone(),
                    bq.location.clone(),
                    bq.poll_interval(),
                ))
            }
            WarehouseConfig::Delta(delta) => {
                let root = StorageProvider::for_url_with_options(
                    &delta.path,
                    delta.storage_options.clone(),
                )
                .await
                .context(SetupSnafu)?;
                let container =
                    provision::for_storage(&root, gcp, &delta.location).context(ConfigSnafu)?;
                Arc::new(DeltaWarehouse::new(Arc::new(root), container))
            }
        };

        Ok(Self::new(source, snapshots, WarehouseSink::new(warehouse)))
    }

    /// State of the most recent run.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run the job once for `run_date`.
    pub async fn run(&mut self, run_date: RunDate) -> Result<RunReport, PipelineError> {
        let start = Instant::now();
        self.state = RunState::Idle;
        info!(
            "Starting ETL run {} (source {}, snapshots {}, warehouse {})",
            run_date,
            self.source.describe(),
            self.snapshots.location(),
            self.warehouse.dataset()
        );

        let result = self.execute(run_date, start).await;

        match &result {
            Ok(report) => {
                self.transition(RunState::Done);
                info!(
                    "ETL run {} completed: {} items, {} snapshots, {} tables in {:?}",
                    run_date,
                    report.items,
                    report.published.len(),
                    report.loaded.len(),
                    report.duration
                );
                emit!(RunCompleted {
                    status: RunStatus::Success,
                    error_kind: None,
                    duration: start.elapsed(),
                });
            }
            Err(e) => {
                let stage = self.state;
                self.transition(RunState::Failed);
                error!("ETL run {} failed while {}: {}", run_date, stage, e.message());
                if let Some(published) = e.published().filter(|p| !p.is_empty()) {
                    warn!(
                        "Snapshots already published: {:?}",
                        published
                            .snapshots
                            .iter()
                            .map(|s| s.key.as_str())
                            .collect::<Vec<_>>()
                    );
                }
                if let Some(loaded) = e.loaded().filter(|l| !l.is_empty()) {
                    warn!(
                        "Tables already replaced: {:?}",
                        loaded
                            .tables
                            .iter()
                            .map(|t| t.table.as_str())
                            .collect::<Vec<_>>()
                    );
                }
                emit!(RunCompleted {
                    status: RunStatus::Failed,
                    error_kind: e.kind(),
                    duration: start.elapsed(),
                });
            }
        }

        result
    }

    async fn execute(
        &mut self,
        run_date: RunDate,
        start: Instant,
    ) -> Result<RunReport, PipelineError> {
        self.transition(RunState::Extracting);
        let catalog = self.source.fetch().await.context(ExtractSnafu)?;
        info!("Fetched {} catalog items", catalog.len());

        self.transition(RunState::Transforming);
        let projections = transform::shape(&catalog);

        self.transition(RunState::SnapshotLoading);
        let published = self
            .snapshots
            .publish(&projections, run_date)
            .await
            .context(SnapshotSnafu)?;

        self.transition(RunState::WarehouseLoading);
        let loaded = match self.warehouse.load(&projections).await {
            Ok(loaded) => loaded,
            Err(source) => return Err(PipelineError::Warehouse { published, source }),
        };

        Ok(RunReport {
            run_date,
            items: catalog.len(),
            published,
            loaded,
            duration: start.elapsed(),
        })
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run state {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Build a pipeline from `config` and run it once for today's date.
pub async fn run_pipeline(config: &Config) -> Result<RunReport, PipelineError> {
    let mut pipeline = Pipeline::from_config(config).await?;
    pipeline.run(RunDate::today()).await
}
