//! Destination provisioning.
//!
//! A destination (snapshot container or warehouse dataset) is looked up
//! before the first write and created when it is missing. A failed lookup is
//! treated as "missing"; a create that loses a race with another writer is
//! accepted.

use async_trait::async_trait;
use serde_json::json;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{
    ConfigError, CreateDirectorySnafu, CreateRemoteSnafu, LookupSnafu, MissingGcpConfigSnafu,
    ProvisionError,
};
use crate::gcp::GcpClient;
use crate::metrics::events::{ResourceKind, ResourceProvisioned};

use super::{BackendConfig, StorageProvider};

/// HTTP status Google APIs answer with when a resource already exists.
pub const CONFLICT: u16 = 409;

/// Result of making sure a destination exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The lookup found the resource.
    Existing,
    /// The resource was created by this call.
    Created,
    /// The create call reported that the resource already exists.
    AlreadyExists,
}

impl Provisioned {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provisioned::Existing => "existing",
            Provisioned::Created => "created",
            Provisioned::AlreadyExists => "already_exists",
        }
    }
}

/// A destination that can be looked up and created.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// What is being provisioned.
    fn kind(&self) -> ResourceKind;

    /// Human-readable resource name for logs and errors.
    fn resource(&self) -> String;

    /// Whether the resource exists.
    async fn lookup(&self) -> Result<bool, ProvisionError>;

    /// Create the resource. Returns `AlreadyExists` on a conflict.
    async fn create(&self) -> Result<Provisioned, ProvisionError>;
}

/// Make sure the destination exists, creating it when the lookup fails or
/// reports it missing.
pub async fn ensure(provisioner: &dyn Provisioner) -> Result<Provisioned, ProvisionError> {
    let resource = provisioner.resource();
    let outcome = match provisioner.lookup().await {
        Ok(true) => {
            debug!("{} exists", resource);
            Provisioned::Existing
        }
        Ok(false) => {
            info!("{} not found, creating it", resource);
            provisioner.create().await?
        }
        Err(e) => {
            warn!("Lookup of {} failed ({}), attempting to create it", resource, e);
            provisioner.create().await?
        }
    };

    emit!(ResourceProvisioned {
        kind: provisioner.kind(),
        outcome: outcome.as_str(),
    });
    Ok(outcome)
}

/// Build the container provisioner for a storage provider. GCS buckets
/// need a Google Cloud client.
pub fn for_storage(
    storage: &StorageProvider,
    gcp: Option<Arc<GcpClient>>,
    location: &str,
) -> Result<Arc<dyn Provisioner>, ConfigError> {
    match (storage.config(), gcp) {
        (BackendConfig::Local(local), _) => Ok(Arc::new(LocalDirectory {
            path: PathBuf::from(&local.path),
        })),
        (BackendConfig::Gcs(gcs), Some(client)) => Ok(Arc::new(GcsBucket {
            client,
            bucket: gcs.bucket.clone(),
            location: location.to_string(),
        })),
        (BackendConfig::Gcs(gcs), None) => MissingGcpConfigSnafu {
            reason: format!("bucket {} must be provisioned", gcs.bucket),
        }
        .fail(),
    }
}

/// A local directory acting as the snapshot container.
#[derive(Debug)]
pub struct LocalDirectory {
    pub path: PathBuf,
}

#[async_trait]
impl Provisioner for LocalDirectory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Container
    }

    fn resource(&self) -> String {
        format!("directory {}", self.path.display())
    }

    async fn lookup(&self) -> Result<bool, ProvisionError> {
        Ok(tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create(&self) -> Result<Provisioned, ProvisionError> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .context(CreateDirectorySnafu {
                path: self.path.display().to_string(),
            })?;
        Ok(Provisioned::Created)
    }
}

/// A Cloud Storage bucket, created through the JSON API.
#[derive(Debug)]
pub struct GcsBucket {
    pub client: Arc<GcpClient>,
    pub bucket: String,
    pub location: String,
}

#[async_trait]
impl Provisioner for GcsBucket {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Container
    }

    fn resource(&self) -> String {
        format!("bucket {}", self.bucket)
    }

    async fn lookup(&self) -> Result<bool, ProvisionError> {
        let url = format!(
            "{}/storage/v1/b/{}",
            self.client.storage_endpoint(),
            self.bucket
        );
        let found: Option<serde_json::Value> = self
            .client
            .get_json(&url)
            .await
            .context(LookupSnafu {
                resource: self.resource(),
            })?;
        Ok(found.is_some())
    }

    async fn create(&self) -> Result<Provisioned, ProvisionError> {
        let url = format!(
            "{}/storage/v1/b?project={}",
            self.client.storage_endpoint(),
            self.client.project_id()
        );
        let body = json!({ "name": self.bucket, "location": self.location });

        match self
            .client
            .post_json::<_, serde_json::Value>(&url, &body)
            .await
        {
            Ok(_) => {
                info!("Created bucket {} in {}", self.bucket, self.location);
                Ok(Provisioned::Created)
            }
            Err(e) if e.status() == Some(CONFLICT) => Ok(Provisioned::AlreadyExists),
            Err(source) => Err(source).context(CreateRemoteSnafu {
                resource: self.resource(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcp::tests::{serve, test_client};
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn bucket(base: &str) -> GcsBucket {
        GcsBucket {
            client: Arc::new(test_client(base)),
            bucket: "demo-project-store-data".to_string(),
            location: "US".to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_directory_is_created_once() {
        let temp_dir = TempDir::new().unwrap();
        let dir = LocalDirectory {
            path: temp_dir.path().join("store-data"),
        };

        assert_eq!(ensure(&dir).await.unwrap(), Provisioned::Created);
        assert!(dir.path.is_dir());
        assert_eq!(ensure(&dir).await.unwrap(), Provisioned::Existing);
    }

    #[tokio::test]
    async fn test_existing_bucket_is_not_created() {
        let creates = Arc::new(AtomicUsize::new(0));
        let counter = creates.clone();
        let router = Router::new()
            .route(
                "/storage/v1/b/demo-project-store-data",
                get(|| async { axum::Json(json!({ "name": "demo-project-store-data" })) }),
            )
            .route(
                "/storage/v1/b",
                post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { axum::Json(json!({})) }
                }),
            );
        let base = serve(router).await;

        assert_eq!(ensure(&bucket(&base)).await.unwrap(), Provisioned::Existing);
        assert_eq!(creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_bucket_is_created_with_location() {
        let router = Router::new().route(
            "/storage/v1/b",
            post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                assert_eq!(body["name"], "demo-project-store-data");
                assert_eq!(body["location"], "US");
                axum::Json(body)
            }),
        );
        let base = serve(router).await;

        assert_eq!(ensure(&bucket(&base)).await.unwrap(), Provisioned::Created);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_through_to_create() {
        let router = Router::new()
            .route(
                "/storage/v1/b/demo-project-store-data",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "backend error") }),
            )
            .route(
                "/storage/v1/b",
                post(|| async { (StatusCode::CONFLICT, "already exists") }),
            );
        let base = serve(router).await;

        assert_eq!(
            ensure(&bucket(&base)).await.unwrap(),
            Provisioned::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_create_failure_is_reported() {
        let router = Router::new().route(
            "/storage/v1/b",
            post(|| async { (StatusCode::FORBIDDEN, "permission denied") }),
        );
        let base = serve(router).await;

        let err = ensure(&bucket(&base)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::CreateRemote { .. }));
    }
}
