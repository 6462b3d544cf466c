//! Mirror executor.
//!
//! Copies planned mappings between transports: registry to file layout
//! during create, file layout to registry during publish. Handles the
//! blocked-image filter, per-blob deduplication, skip-missing semantics,
//! and retry of transient failures under capped exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use airlift_core::{ImageReference, MirrorError, Result, Transport};

use crate::layout::FileLayout;
use crate::plan::Mapping;
use crate::registry::RegistryClient;

/// Per-mapping progress, reported in copy results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Pending,
    FetchingManifest,
    FetchingBlobs,
    Writing,
    Done,
    Skipped,
    Failed,
}

/// Outcome of copying one mapping.
#[derive(Debug, Clone)]
pub struct CopyResult {
    pub state: MappingState,
    /// Digest of the top manifest when the copy completed
    pub manifest_digest: Option<String>,
}

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub blocked: Vec<String>,
    pub skip_missing: bool,
    pub continue_on_error: bool,
    pub dry_run: bool,
    /// Parallel blob transfers per image
    pub parallel_blobs: usize,
    pub retry: RetryPolicy,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        MirrorOptions {
            blocked: Vec::new(),
            skip_missing: false,
            continue_on_error: false,
            dry_run: false,
            parallel_blobs: 6,
            retry: RetryPolicy::default(),
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), doubling up to the
    /// cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        std::cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

/// Retry classification is a pure function over the error kind: network
/// transients and server-side failures retry, everything else is final.
pub fn is_retryable(err: &MirrorError) -> bool {
    match err {
        MirrorError::Transient(_) => true,
        MirrorError::Registry {
            status: Some(code), ..
        } => *code >= 500,
        MirrorError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}

/// True when the source matches a blocked-list entry by repository.
pub fn is_blocked(blocked: &[String], source: &ImageReference) -> bool {
    let qualified = source.qualified_repository();
    blocked.iter().any(|b| {
        let b = b.trim_end_matches('/');
        qualified == b || source.exact() == b || source.name == b
    })
}

pub struct MirrorExecutor<'a> {
    registry: &'a RegistryClient,
    layout: &'a FileLayout,
    opts: MirrorOptions,
    cancel: CancellationToken,
}

impl<'a> MirrorExecutor<'a> {
    pub fn new(
        registry: &'a RegistryClient,
        layout: &'a FileLayout,
        opts: MirrorOptions,
        cancel: CancellationToken,
    ) -> Self {
        MirrorExecutor {
            registry,
            layout,
            opts,
            cancel,
        }
    }

    pub fn options(&self) -> &MirrorOptions {
        &self.opts
    }

    /// Copy one mapping end to end.
    pub async fn copy(&self, mapping: &Mapping) -> Result<CopyResult> {
        if self.cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }

        if is_blocked(&self.opts.blocked, &mapping.source) {
            tracing::info!(image = %mapping.source, "image is blocked, skipping");
            return Ok(CopyResult {
                state: MappingState::Skipped,
                manifest_digest: None,
            });
        }

        if self.opts.dry_run {
            tracing::info!(
                source = %mapping.source,
                destination = %mapping.destination,
                "dry run, skipping transfer"
            );
            return Ok(CopyResult {
                state: MappingState::Done,
                manifest_digest: mapping.source.digest.clone(),
            });
        }

        let result = match (mapping.source.transport, mapping.destination.transport) {
            (Transport::Docker, Transport::File) => self.pull_to_layout(mapping).await,
            (Transport::File, Transport::Docker) => self.push_from_layout(mapping).await,
            (Transport::Docker, Transport::Docker) => self.registry_to_registry(mapping).await,
            (src, dst) => Err(MirrorError::InvalidComponent(format!(
                "unsupported transport pair {}->{}",
                src.scheme(),
                dst.scheme()
            ))),
        };

        match result {
            Err(MirrorError::ManifestUnknown(reference)) if self.opts.skip_missing => {
                tracing::warn!(image = %reference, "source missing, skipping");
                Ok(CopyResult {
                    state: MappingState::Skipped,
                    manifest_digest: None,
                })
            }
            other => other,
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let policy = &self.opts.retry;
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    tracing::debug!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Registry -> file layout: the create phase.
    async fn pull_to_layout(&self, mapping: &Mapping) -> Result<CopyResult> {
        let source = &mapping.source;
        let image_path = FileLayout::image_path(&mapping.destination);
        tracing::debug!(image = %source, state = ?MappingState::FetchingManifest, "pulling manifest");

        let manifest = self.with_retry(|| self.registry.pull_manifest(source)).await?;

        let mut manifests = vec![(manifest.digest.clone(), manifest.body.clone())];
        let mut blob_digests = Vec::new();

        if manifest.is_list() {
            let parsed: serde_json::Value = serde_json::from_slice(&manifest.body)?;
            for child in child_digests(&parsed) {
                let child_ref = source.pinned_to(&child);
                let child_manifest = self
                    .with_retry(|| self.registry.pull_manifest(&child_ref))
                    .await?;
                blob_digests.extend(blob_digests_of(&child_manifest.body)?);
                manifests.push((child, child_manifest.body));
            }
        } else {
            blob_digests.extend(blob_digests_of(&manifest.body)?);
        }

        tracing::debug!(image = %source, state = ?MappingState::FetchingBlobs, blobs = blob_digests.len(), "fetching blobs");
        blob_digests.sort();
        blob_digests.dedup();

        let semaphore = Arc::new(Semaphore::new(self.opts.parallel_blobs.max(1)));
        let mut tasks = Vec::new();
        for digest in blob_digests {
            if self.layout.has_blob(&image_path, &digest) {
                continue;
            }
            let semaphore = semaphore.clone();
            tasks.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| MirrorError::Cancelled)?;
                let data = self.with_retry(|| self.registry.pull_blob(source, &digest)).await?;
                Ok::<_, MirrorError>((digest, data))
            });
        }
        // Polled concurrently, bounded by the semaphore each task holds.
        let results = futures::future::join_all(tasks).await;

        tracing::debug!(image = %source, state = ?MappingState::Writing, "writing layout");
        for result in results {
            let (digest, data) = result?;
            self.layout.write_blob(&image_path, &digest, &data)?;
        }
        for (digest, body) in &manifests[1..] {
            self.layout.write_manifest(&image_path, digest, None, body)?;
        }
        self.layout.write_manifest(
            &image_path,
            &manifest.digest,
            source.tag.as_deref(),
            &manifest.body,
        )?;

        Ok(CopyResult {
            state: MappingState::Done,
            manifest_digest: Some(manifest.digest),
        })
    }

    // File layout -> registry: the publish phase. Blob pushes are
    // idempotent so an interrupted publish simply reruns.
    async fn push_from_layout(&self, mapping: &Mapping) -> Result<CopyResult> {
        let image_path = FileLayout::image_path(&mapping.source);
        let destination = &mapping.destination;

        let digest = match &mapping.source.digest {
            Some(d) => d.clone(),
            None => self.layout.resolve_tag(
                &image_path,
                mapping.source.tag.as_deref().unwrap_or("latest"),
            )?,
        };
        let body = self.layout.read_manifest(&image_path, &digest)?;

        let parsed: serde_json::Value = serde_json::from_slice(&body)?;
        if parsed.get("manifests").is_some() {
            for child in child_digests(&parsed) {
                let child_body = self.layout.read_manifest(&image_path, &child)?;
                self.push_manifest_blobs(&image_path, destination, &child_body).await?;
                let child_dest = ImageReference {
                    tag: None,
                    digest: Some(child.clone()),
                    ..destination.clone()
                };
                let media_type = manifest_media_type(&child_body);
                self.with_retry(|| {
                    self.registry
                        .push_manifest(&child_dest, child_body.clone(), &media_type)
                })
                .await?;
            }
        } else {
            self.push_manifest_blobs(&image_path, destination, &body).await?;
        }

        let media_type = manifest_media_type(&body);
        let pushed = self
            .with_retry(|| self.registry.push_manifest(destination, body.clone(), &media_type))
            .await?;

        Ok(CopyResult {
            state: MappingState::Done,
            manifest_digest: Some(pushed),
        })
    }

    async fn push_manifest_blobs(
        &self,
        image_path: &str,
        destination: &ImageReference,
        manifest_body: &[u8],
    ) -> Result<()> {
        for digest in blob_digests_of(manifest_body)? {
            let data = self.layout.read_blob(image_path, &digest)?;
            self.with_retry(|| self.registry.push_blob(destination, &data)).await?;
        }
        Ok(())
    }

    // Registry -> registry, used by the mirror-to-mirror path.
    async fn registry_to_registry(&self, mapping: &Mapping) -> Result<CopyResult> {
        let source = &mapping.source;
        let destination = &mapping.destination;
        let manifest = self.with_retry(|| self.registry.pull_manifest(source)).await?;

        if manifest.is_list() {
            let parsed: serde_json::Value = serde_json::from_slice(&manifest.body)?;
            for child in child_digests(&parsed) {
                let child_ref = source.pinned_to(&child);
                let child_manifest = self
                    .with_retry(|| self.registry.pull_manifest(&child_ref))
                    .await?;
                for digest in blob_digests_of(&child_manifest.body)? {
                    let data = self.with_retry(|| self.registry.pull_blob(source, &digest)).await?;
                    self.with_retry(|| self.registry.push_blob(destination, &data)).await?;
                }
                let child_dest = ImageReference {
                    tag: None,
                    digest: Some(child.clone()),
                    ..destination.clone()
                };
                let media_type = manifest_media_type(&child_manifest.body);
                self.with_retry(|| {
                    self.registry
                        .push_manifest(&child_dest, child_manifest.body.clone(), &media_type)
                })
                .await?;
            }
        } else {
            for digest in blob_digests_of(&manifest.body)? {
                let data = self.with_retry(|| self.registry.pull_blob(source, &digest)).await?;
                self.with_retry(|| self.registry.push_blob(destination, &data)).await?;
            }
        }

        let media_type = manifest_media_type(&manifest.body);
        let pushed = self
            .with_retry(|| {
                self.registry
                    .push_manifest(destination, manifest.body.clone(), &media_type)
            })
            .await?;
        Ok(CopyResult {
            state: MappingState::Done,
            manifest_digest: Some(pushed),
        })
    }
}

/// Layer and config digests referenced by an image manifest.
pub fn blob_digests_of(manifest_body: &[u8]) -> Result<Vec<String>> {
    let parsed: serde_json::Value = serde_json::from_slice(manifest_body)?;
    let mut digests = Vec::new();
    if let Some(config) = parsed
        .get("config")
        .and_then(|c| c.get("digest"))
        .and_then(|d| d.as_str())
    {
        digests.push(config.to_string());
    }
    if let Some(layers) = parsed.get("layers").and_then(|l| l.as_array()) {
        for layer in layers {
            if let Some(digest) = layer.get("digest").and_then(|d| d.as_str()) {
                digests.push(digest.to_string());
            }
        }
    }
    Ok(digests)
}

/// Child manifest digests of a manifest list.
pub fn child_digests(parsed: &serde_json::Value) -> Vec<String> {
    parsed
        .get("manifests")
        .and_then(|m| m.as_array())
        .map(|children| {
            children
                .iter()
                .filter_map(|c| c.get("digest").and_then(|d| d.as_str()))
                .map(|d| d.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn manifest_media_type(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("mediaType")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string())
}
