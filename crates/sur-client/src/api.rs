//! HTTP client for the separation service.
//!
//! `ServiceClient` is the one concrete implementation; the components only
//! see the narrow traits below, so each can be driven by a scripted fake.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use sur_proto::config::ServerConfig;
use sur_proto::protocol::{ErrorDetail, HealthResponse, SeparationJob, StatusBody};
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, ExportError, PollingError, UploadError};

pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> impl Future<Output = Result<HealthResponse, ConnectionError>> + Send;
}

pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<SeparationJob, UploadError>> + Send;
}

pub trait StatusSource: Send + Sync {
    fn job_status(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<SeparationJob, PollingError>> + Send;
}

pub trait StemSource: Send + Sync {
    fn fetch_stem(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, ExportError>> + Send;
}

#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
}

impl ServiceClient {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        health_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sur/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            health_timeout,
        })
    }

    pub fn from_config(server: &ServerConfig) -> anyhow::Result<Self> {
        Self::new(
            &server.base_url,
            server.request_timeout(),
            server.health_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a server path (`/stems/..`) against the base URL. Absolute
    /// URLs are returned untouched.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// `{base}/status/{job_id}` with the id escaped as one path segment.
    pub fn status_url(&self, job_id: &str) -> Result<reqwest::Url, PollingError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| PollingError::Transport(format!("invalid base url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| PollingError::Transport(format!("invalid base url: {}", self.base_url)))?
            .pop_if_empty()
            .push("status")
            .push(job_id);
        Ok(url)
    }

    pub async fn health(&self) -> Result<HealthResponse, ConnectionError> {
        let response = self
            .http
            .get(self.url_for("/health"))
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Status(status.as_u16()));
        }

        response
            .json::<HealthResponse>()
            .await
            .map_err(|e| ConnectionError::Body(e.to_string()))
    }

    pub async fn upload(&self, filename: &str, bytes: Vec<u8>) -> Result<SeparationJob, UploadError> {
        let size = bytes.len();
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|e| UploadError::Transport {
                reason: e.to_string(),
            })?;
        let form = Form::new().part("file", part);

        info!("upload: sending {} ({} bytes)", filename, size);
        let response = self
            .http
            .post(self.url_for("/upload"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transport {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorDetail>(&body)
                .ok()
                .and_then(|d| d.message())
                .unwrap_or_else(|| "upload failed".to_string());
            warn!("upload: rejected with {}: {}", status, detail);
            return Err(UploadError::Rejected(detail));
        }

        response
            .json::<SeparationJob>()
            .await
            .map_err(|e| UploadError::Decode(e.to_string()))
    }

    pub async fn job_status(&self, job_id: &str) -> Result<SeparationJob, PollingError> {
        let response = self
            .http
            .get(self.status_url(job_id)?)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| PollingError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PollingError::Transport(e.to_string()))?;
        debug!("status {}: {} {}", job_id, status, body);

        match (status.is_success(), serde_json::from_str::<StatusBody>(&body)) {
            // An envelope carries its own verdict whatever the HTTP status.
            (_, Ok(parsed @ StatusBody::Envelope(_))) | (true, Ok(parsed)) => {
                parsed.into_job().map_err(PollingError::Rejected)
            }
            (false, _) => Err(PollingError::Status(status.as_u16())),
            (true, Err(e)) => Err(PollingError::Decode(e.to_string())),
        }
    }

    pub async fn fetch_stem(&self, path: &str) -> Result<Vec<u8>, ExportError> {
        let url = self.url_for(path);
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "audio/wav")
            .send()
            .await
            .map_err(|e| ExportError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExportError::Fetch(e.to_string()))?;
        debug!("fetched {} ({} bytes)", url, bytes.len());
        Ok(bytes.to_vec())
    }
}

fn mime_for(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    match lower.rsplit('.').next() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("m4a") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        _ => "application/octet-stream",
    }
}

impl HealthProbe for ServiceClient {
    fn probe(&self) -> impl Future<Output = Result<HealthResponse, ConnectionError>> + Send {
        self.health()
    }
}

impl Uploader for ServiceClient {
    fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<SeparationJob, UploadError>> + Send {
        ServiceClient::upload(self, filename, bytes)
    }
}

impl StatusSource for ServiceClient {
    fn job_status(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<SeparationJob, PollingError>> + Send {
        ServiceClient::job_status(self, job_id)
    }
}

impl StemSource for ServiceClient {
    fn fetch_stem(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, ExportError>> + Send {
        ServiceClient::fetch_stem(self, path)
    }
}

impl<T: HealthProbe> HealthProbe for Arc<T> {
    fn probe(&self) -> impl Future<Output = Result<HealthResponse, ConnectionError>> + Send {
        (**self).probe()
    }
}

impl<T: StatusSource> StatusSource for Arc<T> {
    fn job_status(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<SeparationJob, PollingError>> + Send {
        (**self).job_status(job_id)
    }
}

impl<T: StemSource> StemSource for Arc<T> {
    fn fetch_stem(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, ExportError>> + Send {
        (**self).fetch_stem(path)
    }
}
