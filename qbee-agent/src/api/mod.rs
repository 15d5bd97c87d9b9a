use anyhow::Result;
use async_trait::async_trait;
use qbee_shared::config::CommittedConfig;
use qbee_shared::files::{FileMetadata, FileMetadataResponse};
use qbee_shared::report::Report;
use serde::Deserialize;
use std::time::Duration;

/// Error kind returned by every control-plane call. Connection errors are
/// counted by the connectivity watchdog; protocol errors carry the decoded
/// response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("connection error: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("api request failed with status {status}: {body}")]
    Protocol { status: u16, body: String },
}

impl ApiError {
    pub fn is_connection(&self) -> bool {
        matches!(self, ApiError::Connection(_))
    }

    /// Transport failures count as connection errors; a body that fails to
    /// decode is proof the control plane answered, so it does not.
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ApiError::Protocol {
                status: error
                    .status()
                    .map(|status| status.as_u16())
                    .unwrap_or_default(),
                body: error.to_string(),
            }
        } else {
            ApiError::Connection(error)
        }
    }
}

/// True when the underlying cause of `err` is a transport failure rather
/// than a decoded control-plane response.
pub fn is_connection_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_connection)
}

/// Produces a signed URL for a control-plane file path, suitable for
/// streaming without device credentials.
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn sign_url(&self, path: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    config: CommittedConfig,
}

/// Typed HTTP client for the device API.
#[derive(Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_http(base_url, http))
    }

    /// Use a pre-built client, e.g. one configured with the device's mTLS
    /// identity by the embedding daemon.
    pub fn with_http(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Protocol {
            status: status.as_u16(),
            body,
        })
    }

    /// Fetch the committed desired-state document.
    pub async fn get_config(&self) -> Result<CommittedConfig, ApiError> {
        let response = self
            .http
            .get(self.url("/v1/org/device/auth/config"))
            .send()
            .await
            .map_err(ApiError::Connection)?;

        let response = Self::check(response).await?;
        let envelope: ConfigResponse = response.json().await.map_err(ApiError::from_reqwest)?;
        Ok(envelope.config)
    }

    /// Fetch checksum/size metadata for a distributable file.
    pub async fn file_metadata(&self, path: &str) -> Result<FileMetadata, ApiError> {
        let path = path.trim_start_matches('/');
        let response = self
            .http
            .get(self.url(&format!("/v1/org/device/auth/filemetadata/{path}")))
            .send()
            .await
            .map_err(ApiError::Connection)?;

        let response = Self::check(response).await?;
        let envelope: FileMetadataResponse =
            response.json().await.map_err(ApiError::from_reqwest)?;
        Ok(envelope.data)
    }

    /// Open a file for download, resuming at `offset` when non-zero. The
    /// returned response streams the remaining bytes.
    pub async fn open_file(
        &self,
        path: &str,
        offset: u64,
    ) -> Result<reqwest::Response, ApiError> {
        let path = path.trim_start_matches('/');
        let mut request = self
            .http
            .get(self.url(&format!("/v1/org/device/auth/files/{path}")));
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(ApiError::Connection)?;
        Self::check(response).await
    }

    /// Deliver one batch of reports as JSON lines. Callers batch to at most
    /// 100 records per request.
    pub async fn post_reports(&self, reports: &[Report]) -> Result<(), ApiError> {
        let mut body = Vec::new();
        for report in reports {
            // Buffered records were redacted and encoded when collected.
            let line = serde_json::to_vec(report).expect("report serialization must not fail");
            body.extend_from_slice(&line);
            body.push(b'\n');
        }

        let response = self
            .http
            .post(self.url("/v1/org/device/auth/report"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(ApiError::Connection)?;

        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl UrlSigner for Client {
    /// Signed URLs resolve through the public files endpoint; the control
    /// plane embeds the signature when it commits the path.
    async fn sign_url(&self, path: &str) -> Result<String> {
        let path = path.trim_start_matches('/');
        Ok(self.url(&format!("/v1/org/device/public/files/{path}")))
    }
}
