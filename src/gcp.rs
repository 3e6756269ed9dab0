//! Google Cloud REST plumbing.
//!
//! A thin JSON client over `reqwest` shared by bucket provisioning and the
//! BigQuery warehouse. Authenticates with a bearer token taken from the
//! configuration, the `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable, or the
//! GCE metadata server, in that order.

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::GcpConfig;
use crate::error::{ApiDecodeSnafu, ApiRequestSnafu, GcpError, TokenSnafu};

/// Environment variable holding a pre-minted access token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh metadata tokens this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, serde::Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
enum TokenSource {
    Static(String),
    Metadata {
        url: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

/// Authenticated JSON client for one Google Cloud project.
#[derive(Debug)]
pub struct GcpClient {
    http: reqwest::Client,
    project_id: String,
    storage_endpoint: String,
    bigquery_endpoint: String,
    token: TokenSource,
}

impl GcpClient {
    pub fn new(http: reqwest::Client, config: &GcpConfig) -> Self {
        let token = match config
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var(ACCESS_TOKEN_ENV).ok())
            .filter(|t| !t.is_empty())
        {
            Some(token) => TokenSource::Static(token),
            None => TokenSource::Metadata {
                url: format!(
                    "{}{}",
                    config.metadata_endpoint.trim_end_matches('/'),
                    METADATA_TOKEN_PATH
                ),
                cached: Mutex::new(None),
            },
        };

        Self {
            http,
            project_id: config.project_id.clone(),
            storage_endpoint: config.storage_endpoint.trim_end_matches('/').to_string(),
            bigquery_endpoint: config.bigquery_endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Base URL of the Cloud Storage JSON API.
    pub fn storage_endpoint(&self) -> &str {
        &self.storage_endpoint
    }

    /// Base URL of the BigQuery API.
    pub fn bigquery_endpoint(&self) -> &str {
        &self.bigquery_endpoint
    }

    /// Current access token, fetching a fresh one from the metadata server
    /// when the cached token is missing or close to expiry.
    pub async fn access_token(&self) -> Result<String, GcpError> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata { url, cached } => {
                let mut cached = cached.lock().await;
                if let Some(token) = cached.as_ref()
                    && Instant::now() < token.expires_at
                {
                    return Ok(token.value.clone());
                }

                debug!("Fetching access token from metadata server");
                let response = self
                    .http
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| {
                        TokenSnafu {
                            message: e.to_string(),
                        }
                        .build()
                    })?;
                let token: MetadataToken = decode(url, response).await?;

                let lifetime = Duration::from_secs(token.expires_in)
                    .saturating_sub(TOKEN_EXPIRY_MARGIN);
                *cached = Some(CachedToken {
                    value: token.access_token.clone(),
                    expires_at: Instant::now() + lifetime,
                });
                Ok(token.access_token)
            }
        }
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, GcpError> {
        let token = self.access_token().await?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// GET a JSON resource. Returns `None` when the resource does not exist.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, GcpError> {
        let response = self
            .request(Method::GET, url)
            .await?
            .send()
            .await
            .context(ApiRequestSnafu { url })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(url, response).await.map(Some)
    }

    /// POST a JSON body and decode the JSON answer.
    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, GcpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(body).context(ApiDecodeSnafu { url })?;
        self.post_bytes(url, "application/json", body).await
    }

    /// POST a raw body with the given content type and decode the JSON answer.
    pub async fn post_bytes<T: DeserializeOwned>(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<T, GcpError> {
        let response = self
            .request(Method::POST, url)
            .await?
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .context(ApiRequestSnafu { url })?;

        decode(url, response).await
    }
}

/// Turn a response into `T`, mapping non-success statuses to `ApiStatus`.
async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, GcpError> {
    let status = response.status();
    let body = response.bytes().await.context(ApiRequestSnafu { url })?;

    if !status.is_success() {
        return Err(GcpError::ApiStatus {
            url: url.to_string(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    serde_json::from_slice(&body).context(ApiDecodeSnafu { url })
}
