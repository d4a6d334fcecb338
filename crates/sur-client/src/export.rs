//! Batch export of a completed job's stems.
//!
//! Stems are fetched strictly one after another in the server's order; a
//! failed stem is recorded and the batch moves on.
use std::future::Future;
use std::path::{Path, PathBuf};

use sur_proto::protocol::StemMap;
use tracing::{error, info};

use crate::api::StemSource;
use crate::error::ExportError;

/// Where fetched stems end up.
pub trait StemSink: Send {
    fn save(
        &mut self,
        filename: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<PathBuf, ExportError>> + Send;
}

/// Writes stems into a directory, creating it on first use.
pub struct DirSink {
    dir: PathBuf,
}

impl DirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StemSink for DirSink {
    fn save(
        &mut self,
        filename: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<PathBuf, ExportError>> + Send {
        let path = self.dir.join(filename);
        let dir = self.dir.clone();
        let bytes = bytes.to_vec();
        async move {
            let save_err = |e: std::io::Error| ExportError::Save {
                path: path.clone(),
                reason: e.to_string(),
            };
            tokio::fs::create_dir_all(&dir).await.map_err(save_err)?;
            tokio::fs::write(&path, &bytes).await.map_err(save_err)?;
            Ok(path)
        }
    }
}

/// Suggested filename for a stem: `{name}.wav`, with path separators
/// replaced so a stem name can never leave the target directory.
pub fn stem_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c => c,
        })
        .collect();
    let safe = match safe.trim() {
        "" | "." | ".." => "stem".to_string(),
        s => s.to_string(),
    };
    format!("{}.wav", safe)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StemFailure {
    pub name: String,
    pub path: String,
    pub error: ExportError,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExportReport {
    pub saved: Vec<PathBuf>,
    pub failures: Vec<StemFailure>,
}

impl ExportReport {
    pub fn attempted(&self) -> usize {
        self.saved.len() + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct BatchExporter<S> {
    source: S,
}

impl<S: StemSource> BatchExporter<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub async fn export_all<K: StemSink>(&self, stems: &StemMap, sink: &mut K) -> ExportReport {
        self.export_each(stems, sink, |_, _| {}).await
    }

    /// Like `export_all`, reporting every stem to `on_stem` as it settles.
    pub async fn export_each<K, F>(
        &self,
        stems: &StemMap,
        sink: &mut K,
        mut on_stem: F,
    ) -> ExportReport
    where
        K: StemSink,
        F: FnMut(&str, &Result<PathBuf, ExportError>),
    {
        let mut report = ExportReport::default();

        for (name, path) in stems {
            let result = match self.source.fetch_stem(path).await {
                Ok(bytes) => sink.save(&stem_filename(name), &bytes).await,
                Err(e) => Err(e),
            };
            on_stem(name, &result);

            match result {
                Ok(saved) => {
                    info!("export: {} → {}", name, saved.display());
                    report.saved.push(saved);
                }
                Err(e) => {
                    error!("export: {} ({}) failed: {}", name, path, e);
                    report.failures.push(StemFailure {
                        name: name.clone(),
                        path: path.clone(),
                        error: e,
                    });
                }
            }
        }

        info!(
            "export: {} saved, {} failed",
            report.saved.len(),
            report.failures.len()
        );
        report
    }
}
