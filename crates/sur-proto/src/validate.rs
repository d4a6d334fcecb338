//! Pre-submission checks on a candidate file.
//!
//! Pure: no network or filesystem access beyond `UploadCandidate::from_path`.
use std::path::Path;

use crate::config::UploadConfig;

/// A file about to be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
    pub filename: String,
    pub size_bytes: u64,
}

impl UploadCandidate {
    pub fn new(filename: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            filename: filename.into(),
            size_bytes,
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(filename, metadata.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unsupported format")]
    UnsupportedFormat { filename: String },
    #[error("size exceeds limit")]
    SizeExceedsLimit { size_bytes: u64, max_bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct Validator {
    extensions: Vec<String>,
    max_size_bytes: u64,
}

impl Validator {
    /// `extensions` are expected lower-case with a leading dot.
    pub fn new(extensions: Vec<String>, max_size_bytes: u64) -> Self {
        Self {
            extensions,
            max_size_bytes,
        }
    }

    pub fn from_config(upload: &UploadConfig) -> Self {
        Self::new(upload.normalized_extensions(), upload.max_size_bytes)
    }

    pub fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Format first, then size.
    pub fn validate(&self, candidate: &UploadCandidate) -> Result<(), ValidationError> {
        let name = candidate.filename.to_lowercase();
        if !self.extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            return Err(ValidationError::UnsupportedFormat {
                filename: candidate.filename.clone(),
            });
        }
        if candidate.size_bytes > self.max_size_bytes {
            return Err(ValidationError::SizeExceedsLimit {
                size_bytes: candidate.size_bytes,
                max_bytes: self.max_size_bytes,
            });
        }
        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn accepts_every_supported_extension_in_any_case() {
        let v = Validator::default();
        for name in ["a.mp3", "b.WAV", "c.Flac", "d.m4a", "e.OGG", "song.final.mp3"] {
            assert_eq!(v.validate(&UploadCandidate::new(name, MIB)), Ok(()), "{}", name);
        }
    }

    #[test]
    fn rejects_unsupported_extension() {
        let v = Validator::default();
        for name in ["notes.txt", "track.mp3.zip", "mp3", "track.aiff", ""] {
            let err = v.validate(&UploadCandidate::new(name, 10)).unwrap_err();
            assert_eq!(err.to_string(), "unsupported format", "{}", name);
        }
    }

    #[test]
    fn size_limit_is_inclusive() {
        let v = Validator::default();
        assert!(v.validate(&UploadCandidate::new("a.wav", 30 * MIB)).is_ok());
        let err = v
            .validate(&UploadCandidate::new("a.wav", 30 * MIB + 1))
            .unwrap_err();
        assert_eq!(err.to_string(), "size exceeds limit");
        assert_eq!(
            err,
            ValidationError::SizeExceedsLimit {
                size_bytes: 30 * MIB + 1,
                max_bytes: 30 * MIB
            }
        );
    }

    #[test]
    fn format_is_checked_before_size() {
        let v = Validator::default();
        let err = v
            .validate(&UploadCandidate::new("huge.txt", 100 * MIB))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedFormat { .. }));
    }

    #[test]
    fn rejection_is_exactly_the_complement_of_acceptance() {
        let v = Validator::new(vec![".wav".into()], 100);
        for (name, size, ok) in [
            ("x.wav", 0, true),
            ("x.wav", 100, true),
            ("x.wav", 101, false),
            ("x.mp3", 50, false),
            ("X.WAV", 99, true),
        ] {
            assert_eq!(v.validate(&UploadCandidate::new(name, size)).is_ok(), ok, "{} {}", name, size);
        }
    }

    #[test]
    fn candidate_from_path_reads_name_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.ogg");
        std::fs::write(&path, vec![0u8; 1234]).unwrap();

        let candidate = UploadCandidate::from_path(&path).unwrap();
        assert_eq!(candidate, UploadCandidate::new("clip.ogg", 1234));
    }
}
