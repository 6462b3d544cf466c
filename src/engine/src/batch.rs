//! Batch worker.
//!
//! Drives the executor across the plan one image at a time, classifying
//! failures as safe (count, log, continue) or unsafe (abort the run).
//! Safe failures are collected into a timestamped error log so a long
//! mirror finishes with a usable report instead of dying on image 7/400.

use std::path::PathBuf;

use thiserror::Error;

use airlift_core::{ImageKind, MirrorError};

use crate::mirror::{CopyResult, MappingState, MirrorExecutor};
use crate::plan::Mapping;

/// Failure classification for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    Safe,
    Unsafe,
}

/// Classify an error for an image of the given kind. Release payloads
/// and authentication failures abort; missing manifests of operator
/// related or additional images, and exhausted transients, do not.
pub fn classify(err: &MirrorError, kind: ImageKind, continue_on_error: bool) -> Safety {
    if matches!(err, MirrorError::Auth(_) | MirrorError::Cancelled) {
        return Safety::Unsafe;
    }
    if kind.is_release() {
        return Safety::Unsafe;
    }
    match err {
        MirrorError::ManifestUnknown(_)
            if matches!(
                kind,
                ImageKind::OperatorRelated | ImageKind::Generic | ImageKind::OperatorBundle
            ) =>
        {
            Safety::Safe
        }
        MirrorError::Transient(_) => Safety::Safe,
        MirrorError::Registry { status: Some(code), .. } if *code >= 500 => Safety::Safe,
        _ if continue_on_error => Safety::Safe,
        _ => Safety::Unsafe,
    }
}

/// The run completed but some images failed.
#[derive(Debug, Error)]
#[error("{count} errors happened during mirroring, refer to {log:?} for details")]
pub struct SafeError {
    pub count: usize,
    pub log: PathBuf,
}

/// The run aborted mid-way on a fatal error.
#[derive(Debug, Error)]
#[error("mirroring aborted: {source}")]
pub struct UnsafeError {
    #[source]
    pub source: MirrorError,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Safe(#[from] SafeError),
    #[error(transparent)]
    Unsafe(#[from] UnsafeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Per-class progress counters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatchCounters {
    pub release: usize,
    pub operator: usize,
    pub additional: usize,
    pub errors: usize,
}

/// Outcome of a completed batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub counters: BatchCounters,
    pub skipped: usize,
    /// Completed mappings with their copy results, in plan order
    pub results: Vec<(Mapping, CopyResult)>,
}

pub struct BatchWorker<'a, 'b> {
    executor: &'a MirrorExecutor<'b>,
    logs_dir: PathBuf,
}

impl<'a, 'b> BatchWorker<'a, 'b> {
    pub fn new(executor: &'a MirrorExecutor<'b>, logs_dir: impl Into<PathBuf>) -> Self {
        BatchWorker {
            executor,
            logs_dir: logs_dir.into(),
        }
    }

    /// Run the plan. Sequential per logical image; the executor fans out
    /// blob transfers internally.
    pub async fn run(&self, mappings: &[Mapping]) -> Result<BatchSummary, BatchError> {
        let total = mappings.len();
        let mut summary = BatchSummary::default();
        let mut failures: Vec<(Mapping, MirrorError)> = Vec::new();

        tracing::info!(total, "start copying the images");
        for (index, mapping) in mappings.iter().enumerate() {
            match mapping.kind {
                ImageKind::ReleasePayload | ImageKind::ReleaseContent | ImageKind::GraphData => {
                    summary.counters.release += 1
                }
                ImageKind::OperatorCatalog
                | ImageKind::OperatorBundle
                | ImageKind::OperatorRelated => summary.counters.operator += 1,
                ImageKind::Generic => summary.counters.additional += 1,
            }
            tracing::info!(
                progress = format!("{}/{total}", index + 1),
                errors = summary.counters.errors,
                image = %mapping.source,
                "copying image"
            );

            match self.executor.copy(mapping).await {
                Ok(result) => {
                    if result.state == MappingState::Skipped {
                        summary.skipped += 1;
                    }
                    summary.results.push((mapping.clone(), result));
                }
                Err(err) => {
                    let continue_on_error = self.executor.options().continue_on_error;
                    match classify(&err, mapping.kind, continue_on_error) {
                        Safety::Unsafe => {
                            tracing::error!(image = %mapping.source, error = %err, "fatal mirror error");
                            return Err(UnsafeError { source: err }.into());
                        }
                        Safety::Safe => {
                            tracing::warn!(image = %mapping.source, error = %err, "image failed, continuing");
                            summary.counters.errors += 1;
                            failures.push((mapping.clone(), err));
                        }
                    }
                }
            }
        }

        let ok = total - summary.counters.errors - summary.skipped;
        tracing::info!(
            ok,
            skipped = summary.skipped,
            failed = summary.counters.errors,
            "batch results"
        );

        if !failures.is_empty() {
            let log = self.write_error_log(&failures)?;
            return Err(SafeError {
                count: failures.len(),
                log,
            }
            .into());
        }
        Ok(summary)
    }

    fn write_error_log(&self, failures: &[(Mapping, MirrorError)]) -> std::io::Result<PathBuf> {
        use std::io::Write;

        std::fs::create_dir_all(&self.logs_dir)?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.logs_dir.join(format!("mirroring_errors_{timestamp}.txt"));
        let mut file = std::fs::File::create(&path)?;
        for (mapping, err) in failures {
            writeln!(file, "error mirroring image {} error: {err}", mapping.source)?;
        }
        Ok(path)
    }
}
