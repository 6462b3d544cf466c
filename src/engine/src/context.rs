//! Per-run scoped resources.
//!
//! Scratch directories, the content-addressed cache of pulled layers,
//! and the cancellation token are carried in one context object created
//! at run start and dropped at run end. Scratch space is removed on
//! drop unless cleanup is skipped for debugging.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use airlift_core::{MirrorError, Result};

/// Content-addressed on-disk cache of pulled layer blobs, shared by
/// catalog pulls within a run and destroyed with it.
#[derive(Debug)]
pub struct LayerCache {
    dir: PathBuf,
}

impl LayerCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(LayerCache { dir })
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        self.dir.join(digest.replace(':', "_"))
    }

    pub fn get(&self, digest: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path_for(digest)).ok()
    }

    pub fn put(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(digest);
        if !path.exists() {
            std::fs::write(&path, data)?;
        }
        Ok(())
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.path_for(digest).is_file()
    }
}

/// One run's workspace and scoped resources.
pub struct RunContext {
    /// Workspace root (`--dir`)
    workspace: PathBuf,
    /// Per-run scratch space, removed on drop unless cleanup is skipped
    scratch: PathBuf,
    skip_cleanup: bool,
    cancel: CancellationToken,
    layer_cache: LayerCache,
}

impl RunContext {
    pub fn new(workspace: impl Into<PathBuf>, skip_cleanup: bool) -> Result<Self> {
        let workspace = workspace.into();
        std::fs::create_dir_all(&workspace)?;
        let scratch = tempfile::Builder::new()
            .prefix("run.")
            .tempdir_in(&workspace)
            .map_err(MirrorError::Io)?
            // Ownership of the path; removal is handled in Drop so the
            // skip-cleanup flag can keep it.
            .into_path();
        let layer_cache = LayerCache::new(scratch.join("layers"))?;
        Ok(RunContext {
            workspace,
            scratch,
            skip_cleanup,
            cancel: CancellationToken::new(),
            layer_cache,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The `src/` tree holding the file layout and rewritten catalogs.
    pub fn src_dir(&self) -> PathBuf {
        self.workspace.join("src")
    }

    /// Staging area for transient per-run files.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace.join("logs")
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn layer_cache(&self) -> &LayerCache {
        &self.layer_cache
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if self.skip_cleanup {
            tracing::info!(dir = %self.scratch.display(), "skipping cleanup of run scratch space");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.scratch) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.scratch.display(), error = %e, "failed to remove scratch space");
            }
        }
    }
}
