//! Wire types for the separation service.
//!
//! The service speaks plain JSON over HTTP:
//!
//! ```text
//!   GET  /health           → {"status": "healthy"}
//!   POST /upload  (file)   → SeparationJob            | {"detail": ...} on error
//!   GET  /status/{job_id}  → {"success", "data", "error"} or a bare SeparationJob
//!   GET  {stem_path}       → audio/wav bytes
//! ```
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// The only health status treated as available.
pub const HEALTHY: &str = "healthy";

/// Stem name → retrieval path, in the order the server listed them.
pub type StemMap = IndexMap<String, String>;

/// Server-reported job status.
///
/// The server sends a free-form string, so this is an open enum: anything
/// unrecognised lands in `Other` and is treated as still running.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobStatus {
    #[default]
    Submitted,
    Processing,
    Completed,
    Failed,
    Other(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "submitted" => JobStatus::Submitted,
            "processing" => JobStatus::Processing,
            // The synchronous upload path answers "success" with the stems attached.
            "completed" | "success" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Other(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(JobStatus::parse(&raw))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationJob {
    #[serde(default)]
    pub job_id: String,
    pub status: JobStatus,
    /// Percent complete as reported by the server; may be absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stems: Option<StemMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SeparationJob {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            progress: None,
            stems: None,
            message: None,
            error: None,
        }
    }

    /// Progress clamped to 0..=100.
    pub fn progress(&self) -> Option<f32> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0))
    }

    /// Stems, but only once the job has completed.
    pub fn completed_stems(&self) -> Option<&StemMap> {
        match self.status {
            JobStatus::Completed => self.stems.as_ref(),
            _ => None,
        }
    }

    /// The message to show for a failed job.
    pub fn failure_message(&self) -> Option<String> {
        if self.status != JobStatus::Failed {
            return None;
        }
        Some(
            self.error
                .clone()
                .or_else(|| self.message.clone())
                .unwrap_or_else(|| "processing failed".to_string()),
        )
    }
}

/// `{success, data?, error?}` envelope used by the polling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    // No `default`: serde would then require `T: Default`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A status body in either of the shapes the server is known to send.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StatusBody {
    Envelope(ApiResponse<SeparationJob>),
    Bare(SeparationJob),
}

impl StatusBody {
    /// Unwrap to the job, or the reason the server gave for not having one.
    pub fn into_job(self) -> Result<SeparationJob, String> {
        match self {
            StatusBody::Bare(job) => Ok(job),
            StatusBody::Envelope(ApiResponse {
                success: true,
                data: Some(job),
                ..
            }) => Ok(job),
            StatusBody::Envelope(ApiResponse { success: true, .. }) => {
                Err("status response missing data".to_string())
            }
            StatusBody::Envelope(ApiResponse { error, .. }) => {
                Err(error.unwrap_or_else(|| "failed to fetch status".to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == HEALTHY
    }
}

/// Error body of a rejected upload. FastAPI puts a string in `detail` for
/// `HTTPException` and a list of objects for request validation failures.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub detail: serde_json::Value,
}

impl ErrorDetail {
    pub fn message(&self) -> Option<String> {
        match &self.detail {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.trim().is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
