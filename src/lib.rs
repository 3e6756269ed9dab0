//! flurry: publishes a product catalog as department projections.
//!
//! One run fetches the catalog over HTTP, shapes it into the sales, product
//! and finance projections, writes a dated JSON snapshot of each projection
//! to object storage and replaces one warehouse table per projection.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, run_pipeline, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("config.yaml")
//!         .map_err(|source| PipelineError::Config { source })?;
//!     let report = run_pipeline(&config).await?;
//!     println!("Loaded {} tables", report.loaded.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gcp;
pub mod metrics;
pub mod pipeline;
pub mod snapshot;
pub mod source;
pub mod storage;
pub mod transform;
pub mod trigger;
pub mod types;
pub mod warehouse;

// Re-export main types
pub use config::Config;
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{Pipeline, RunReport, RunState, run_pipeline};
pub use snapshot::{PublishReport, SnapshotSink};
pub use source::{CatalogItem, CatalogSource, HttpCatalogSource};
pub use storage::{StorageProvider, StorageProviderRef};
pub use transform::{ProjectionName, ProjectionSet, shape};
pub use types::RunDate;
pub use warehouse::{LoadReport, Warehouse, WarehouseSink};
