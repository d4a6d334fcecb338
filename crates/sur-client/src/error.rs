//! Error taxonomy, one type per component boundary.
//!
//! None of these escape their component: each is captured into that
//! component's state or outcome so the front end can render it in place.
use std::path::PathBuf;

pub use sur_proto::validate::ValidationError;

/// A health probe that did not produce a usable answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("{0}")]
    Transport(String),
    #[error("server responded with an error (status {0})")]
    Status(u16),
    #[error("invalid health response: {0}")]
    Body(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Non-2xx answer; carries the server's `detail` verbatim.
    #[error("{0}")]
    Rejected(String),
    /// No response at all. The underlying reason is kept for the log only.
    #[error("upload failed")]
    Transport { reason: String },
    #[error("invalid upload response: {0}")]
    Decode(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Transport or parse failure while polling. Terminal for the job being
/// polled and deliberately distinct from a server-reported failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollingError {
    #[error("failed to connect to server: {0}")]
    Transport(String),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("invalid status response: {0}")]
    Decode(String),
    /// The envelope said `success: false`.
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("failed to load audio: {0}")]
    Load(String),
    #[error("failed to play audio: {0}")]
    Play(String),
    #[error("failed to load audio: {0}")]
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("failed to save {}: {reason}", path.display())]
    Save { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_render_the_user_facing_text() {
        let err = UploadError::Transport {
            reason: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "upload failed");

        let err = UploadError::Rejected("Unsupported file format".into());
        assert_eq!(err.to_string(), "Unsupported file format");
    }

    #[test]
    fn validation_errors_pass_through_unchanged() {
        let err: UploadError = ValidationError::UnsupportedFormat {
            filename: "a.txt".into(),
        }
        .into();
        assert_eq!(err.to_string(), "unsupported format");
    }
}
