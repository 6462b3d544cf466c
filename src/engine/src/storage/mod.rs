//! Metadata storage backends.
//!
//! Two implementations share one capability interface: a plain local
//! directory, and registry-as-storage where the metadata rides inside a
//! single-file OCI image. The registry backend composes the local one for
//! all disk I/O.

use async_trait::async_trait;

use airlift_core::config::StorageConfig;
use airlift_core::{Metadata, Result};

mod local;
mod registry;

pub use local::LocalBackend;
pub use registry::RegistryBackend;

/// Path of the metadata document inside a workspace (and archive).
pub const METADATA_PATH: &str = "publish/.metadata.json";

/// Capability interface over a metadata store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Load the workspace metadata. Returns
    /// [`airlift_core::MirrorError::MetadataNotFound`] when none exists.
    async fn read_metadata(&self) -> Result<Metadata>;

    /// Persist the workspace metadata.
    async fn write_metadata(&self, meta: &Metadata) -> Result<()>;

    /// Read an auxiliary object by workspace-relative path.
    async fn read_object(&self, path: &str) -> Result<Vec<u8>>;

    /// Write an auxiliary object by workspace-relative path.
    async fn write_object(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Open a plain file writer for streaming large objects.
    fn writer(&self, path: &str) -> Result<std::fs::File>;

    /// Verify the backend matches the declared storage configuration.
    fn check_config(&self, storage: &StorageConfig) -> Result<()>;
}

/// Construct the backend declared by the configuration, defaulting to a
/// local directory under the workspace when none is declared.
pub async fn from_config(
    storage: &StorageConfig,
    workspace: &std::path::Path,
    dest_skip_tls: bool,
) -> Result<Box<dyn Backend>> {
    if let Some(reg) = &storage.registry {
        let backend = RegistryBackend::new(
            &reg.image_url,
            reg.skip_tls || dest_skip_tls,
            workspace.to_path_buf(),
        )?;
        return Ok(Box::new(backend));
    }
    let dir = storage
        .local
        .as_ref()
        .map(|l| l.path.clone())
        .unwrap_or_else(|| workspace.to_path_buf());
    Ok(Box::new(LocalBackend::new(dir)?))
}
