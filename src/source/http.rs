//! HTTP catalog source.

use async_trait::async_trait;
use reqwest::StatusCode;
use snafu::prelude::*;
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ExtractError, SourceMalformedSnafu, SourceRequestSnafu, SourceUnavailableSnafu};
use crate::metrics::events::{CatalogFetchCompleted, CatalogItemsFetched};

use super::{Catalog, CatalogSource, parse_catalog};

/// The public product catalog the job was built against.
pub const DEFAULT_CATALOG_URL: &str = "https://fakestoreapi.com/products";

/// Fetches the catalog with one unauthenticated GET.
///
/// No retries and no client-side timeout: a run makes exactly one attempt and
/// inherits whatever limits the network stack applies.
#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    url: String,
}

impl HttpCatalogSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Result<Catalog, ExtractError> {
        let start = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context(SourceRequestSnafu { url: &self.url })?;

        let status = response.status();
        ensure!(
            status == StatusCode::OK,
            SourceUnavailableSnafu {
                url: &self.url,
                status: status.as_u16(),
            }
        );

        let body = response
            .bytes()
            .await
            .context(SourceRequestSnafu { url: &self.url })?;
        debug!("Fetched {} bytes from {}", body.len(), self.url);

        let catalog = parse_catalog(&body).context(SourceMalformedSnafu { url: &self.url })?;

        emit!(CatalogFetchCompleted {
            duration: start.elapsed()
        });
        emit!(CatalogItemsFetched {
            count: catalog.len() as u64
        });

        Ok(catalog)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
