//! Submission of a validated file to the separation service.
//!
//! One request per call and no retry: a failed upload is reported and the
//! user resubmits.  Whether the service is reachable is the caller's gate
//! (see `ConnectionMonitor`), not a check made here.
use std::path::Path;

use sur_proto::protocol::SeparationJob;
use sur_proto::validate::{UploadCandidate, Validator};
use tracing::{info, warn};

use crate::api::Uploader;
use crate::error::UploadError;

pub struct SubmissionClient<U> {
    uploader: U,
    validator: Validator,
}

impl<U: Uploader> SubmissionClient<U> {
    pub fn new(uploader: U, validator: Validator) -> Self {
        Self {
            uploader,
            validator,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Upload an already validated candidate.  The job comes back in
    /// whatever state the server reports, possibly already completed.
    pub async fn submit(
        &self,
        candidate: &UploadCandidate,
        bytes: Vec<u8>,
    ) -> Result<SeparationJob, UploadError> {
        match self.uploader.upload(&candidate.filename, bytes).await {
            Ok(job) => {
                info!(
                    "submit: {} accepted as job {} ({})",
                    candidate.filename, job.job_id, job.status
                );
                Ok(job)
            }
            Err(e) => {
                warn!("submit: {} failed: {:?}", candidate.filename, e);
                Err(e)
            }
        }
    }

    /// Validate a file on disk, read it and submit it.  Validation runs
    /// before the file is read, so a rejected file costs no I/O beyond its
    /// metadata and no network at all.
    pub async fn submit_path(&self, path: &Path) -> Result<SeparationJob, UploadError> {
        let candidate = UploadCandidate::from_path(path).map_err(|source| UploadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.validator.validate(&candidate)?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.submit(&candidate, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use sur_proto::protocol::JobStatus;

    #[derive(Default)]
    struct RecordingUploader {
        calls: AtomicUsize,
        last_name: Mutex<Option<String>>,
        reject_with: Option<String>,
    }

    impl Uploader for RecordingUploader {
        fn upload(
            &self,
            filename: &str,
            bytes: Vec<u8>,
        ) -> impl Future<Output = Result<SeparationJob, UploadError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_name.lock().unwrap() = Some(filename.to_string());
            let result = match &self.reject_with {
                Some(detail) => Err(UploadError::Rejected(detail.clone())),
                None => {
                    let mut job = SeparationJob::new("job-7", JobStatus::Submitted);
                    job.message = Some(format!("{} bytes", bytes.len()));
                    Ok(job)
                }
            };
            std::future::ready(result)
        }
    }

    fn temp_file(name: &str, len: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, vec![7u8; len]).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn submit_path_uploads_valid_file() {
        let (_dir, path) = temp_file("take 3.wav", 2048);
        let client = SubmissionClient::new(RecordingUploader::default(), Validator::default());

        let job = client.submit_path(&path).await.unwrap();
        assert_eq!(job.job_id, "job-7");
        assert_eq!(job.message.as_deref(), Some("2048 bytes"));
        assert_eq!(
            client.uploader.last_name.lock().unwrap().as_deref(),
            Some("take 3.wav")
        );
    }

    #[tokio::test]
    async fn invalid_file_never_reaches_the_network() {
        let (_dir, path) = temp_file("lyrics.txt", 10);
        let client = SubmissionClient::new(RecordingUploader::default(), Validator::default());

        let err = client.submit_path(&path).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(err.to_string(), "unsupported format");
        assert_eq!(client.uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_upload() {
        let (_dir, path) = temp_file("big.mp3", 64);
        let validator = Validator::new(vec![".mp3".into()], 32);
        let client = SubmissionClient::new(RecordingUploader::default(), validator);

        let err = client.submit_path(&path).await.unwrap_err();
        assert_eq!(err.to_string(), "size exceeds limit");
        assert_eq!(client.uploader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn server_rejection_is_surfaced_once_without_retry() {
        let uploader = RecordingUploader {
            reject_with: Some("Unsupported file format".into()),
            ..Default::default()
        };
        let client = SubmissionClient::new(uploader, Validator::default());
        let candidate = UploadCandidate::new("a.flac", 3);

        let err = client.submit(&candidate, vec![1, 2, 3]).await.unwrap_err();
        assert_eq!(err.to_string(), "Unsupported file format");
        assert_eq!(client.uploader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let client = SubmissionClient::new(RecordingUploader::default(), Validator::default());
        let err = client
            .submit_path(Path::new("/definitely/not/here.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Read { .. }));
    }
}
