//! Snapshot sink.
//!
//! Publishes each projection as one pretty-printed JSON document under a key
//! derived from the projection name and the run date. Writes overwrite, so a
//! same-day rerun replaces that day's documents. The three writes are not
//! transactional: a failure leaves earlier documents in place and reports
//! them through [`PublishError`].

use bytes::Bytes;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

use crate::emit;
use crate::error::{
    PublishError, SnapshotError, SnapshotSerializeSnafu, SnapshotWriteSnafu,
};
use crate::metrics::events::SnapshotPublished;
use crate::storage::StorageProviderRef;
use crate::storage::provision::{self, Provisioner};
use crate::transform::{Projection, ProjectionName, ProjectionSet};
use crate::types::RunDate;

/// Content type of snapshot documents.
pub const SNAPSHOT_CONTENT_TYPE: &str = "application/json";

/// Object key of a projection's snapshot for one run date.
pub fn snapshot_key(name: ProjectionName, run_date: RunDate) -> Path {
    Path::from(format!("{}_{}.json", name.table_name(), run_date))
}

/// One snapshot document that was durably written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSnapshot {
    pub projection: ProjectionName,
    pub key: String,
    pub bytes: u64,
}

/// Snapshots written by one publish call, in publish order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub snapshots: Vec<PublishedSnapshot>,
}

impl PublishReport {
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn contains(&self, projection: ProjectionName) -> bool {
        self.snapshots.iter().any(|s| s.projection == projection)
    }
}

/// Writes dated projection documents into the snapshot container.
pub struct SnapshotSink {
    storage: StorageProviderRef,
    container: Arc<dyn Provisioner>,
}

impl SnapshotSink {
    pub fn new(storage: StorageProviderRef, container: Arc<dyn Provisioner>) -> Self {
        Self { storage, container }
    }

    /// URL of the snapshot container root.
    pub fn location(&self) -> &str {
        self.storage.canonical_url()
    }

    /// Publish all projections for `run_date`.
    pub async fn publish(
        &self,
        projections: &ProjectionSet,
        run_date: RunDate,
    ) -> Result<PublishReport, PublishError> {
        let mut report = PublishReport::default();

        if let Err(source) = provision::ensure(self.container.as_ref()).await {
            return Err(PublishError {
                published: report,
                source: SnapshotError::ContainerProvision {
                    container: self.location().to_string(),
                    source,
                },
            });
        }

        for (name, projection) in projections.iter() {
            match self.write(name, projection, run_date).await {
                Ok(snapshot) => {
                    info!(
                        "Published {} snapshot {} ({} records)",
                        name,
                        snapshot.key,
                        projection.len()
                    );
                    emit!(SnapshotPublished {
                        projection: name,
                        bytes: snapshot.bytes,
                    });
                    report.snapshots.push(snapshot);
                }
                Err(source) => {
                    return Err(PublishError {
                        published: report,
                        source,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn write(
        &self,
        name: ProjectionName,
        projection: Projection<'_>,
        run_date: RunDate,
    ) -> Result<PublishedSnapshot, SnapshotError> {
        let key = snapshot_key(name, run_date);
        let body = projection
            .to_pretty_json()
            .context(SnapshotSerializeSnafu { projection: name })?;
        let bytes = body.len() as u64;

        debug!("Writing {} bytes to {}", bytes, key);
        self.storage
            .put_document(&key, Bytes::from(body), SNAPSHOT_CONTENT_TYPE)
            .await
            .context(SnapshotWriteSnafu {
                key: key.to_string(),
            })?;

        Ok(PublishedSnapshot {
            projection: name,
            key: key.to_string(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::parse_catalog;
    use crate::storage::StorageProvider;
    use crate::storage::provision::LocalDirectory;
    use crate::transform::shape;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const SHIRT: &[u8] = br#"[{"id":1,"title":"Shirt","price":19.99,"category":"clothing",
        "description":"desc","image":"img.jpg","rating":{"rate":4.2,"count":120}}]"#;

    fn run_date() -> RunDate {
        RunDate::from_ymd(2024, 5, 1).unwrap()
    }

    async fn sink(root: &std::path::Path) -> SnapshotSink {
        let storage = StorageProvider::for_url_with_options(root.to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        SnapshotSink::new(
            Arc::new(storage),
            Arc::new(LocalDirectory {
                path: root.to_path_buf(),
            }),
        )
    }

    fn read_json(path: std::path::PathBuf) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_snapshot_key() {
        assert_eq!(
            snapshot_key(ProjectionName::Sales, run_date()).as_ref(),
            "sales_products_2024-05-01.json"
        );
        assert_eq!(
            snapshot_key(ProjectionName::Finance, run_date()).as_ref(),
            "finance_products_2024-05-01.json"
        );
    }

    #[tokio::test]
    async fn test_publish_writes_all_projections() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store-data");
        let sink = sink(&root).await;
        let projections = shape(&parse_catalog(SHIRT).unwrap());

        let report = sink.publish(&projections, run_date()).await.unwrap();

        assert_eq!(report.len(), 3);
        assert_eq!(
            report
                .snapshots
                .iter()
                .map(|s| s.projection)
                .collect::<Vec<_>>(),
            ProjectionName::ALL.to_vec()
        );

        let finance = read_json(root.join("finance_products_2024-05-01.json"));
        assert_eq!(
            finance,
            serde_json::json!([{ "id": 1, "price": 19.99, "rating": 4.2 }])
        );
        let raw = std::fs::read_to_string(root.join("sales_products_2024-05-01.json")).unwrap();
        assert!(raw.contains("\n  {\n    \"title\": \"Shirt\""), "{raw}");
    }

    #[tokio::test]
    async fn test_same_day_rerun_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let sink = sink(temp_dir.path()).await;

        sink.publish(&shape(&parse_catalog(SHIRT).unwrap()), run_date())
            .await
            .unwrap();
        sink.publish(&shape(&[]), run_date()).await.unwrap();

        let sales_files: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("sales_"))
            .collect();
        assert_eq!(sales_files.len(), 1);
        assert_eq!(
            read_json(temp_dir.path().join("sales_products_2024-05-01.json")),
            serde_json::json!([])
        );
    }

    #[tokio::test]
    async fn test_new_day_adds_documents() {
        let temp_dir = TempDir::new().unwrap();
        let sink = sink(temp_dir.path()).await;
        let projections = shape(&[]);

        sink.publish(&projections, run_date()).await.unwrap();
        sink.publish(&projections, RunDate::from_ymd(2024, 5, 2).unwrap())
            .await
            .unwrap();

        assert!(temp_dir.path().join("product_products_2024-05-01.json").is_file());
        assert!(temp_dir.path().join("product_products_2024-05-02.json").is_file());
    }

    #[tokio::test]
    async fn test_failure_reports_earlier_snapshots() {
        let temp_dir = TempDir::new().unwrap();
        // A directory at the product key makes that write fail.
        std::fs::create_dir_all(
            temp_dir
                .path()
                .join("product_products_2024-05-01.json")
                .join("blocker"),
        )
        .unwrap();
        let sink = sink(temp_dir.path()).await;

        let err = sink
            .publish(&shape(&parse_catalog(SHIRT).unwrap()), run_date())
            .await
            .unwrap_err();

        assert_eq!(err.source.kind(), ErrorKind::SinkWriteFailure);
        assert_eq!(err.published.len(), 1);
        assert!(err.published.contains(ProjectionName::Sales));
        assert!(temp_dir.path().join("sales_products_2024-05-01.json").is_file());
        assert!(!temp_dir.path().join("finance_products_2024-05-01.json").exists());
    }

    #[tokio::test]
    async fn test_unprovisionable_container_fails_before_writes() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("not-a-directory");
        std::fs::write(&file, b"").unwrap();
        let sink = sink(&file).await;

        let err = sink.publish(&shape(&[]), run_date()).await.unwrap_err();

        assert_eq!(err.source.kind(), ErrorKind::DestinationProvisionFailure);
        assert!(err.published.is_empty());
    }
}
