//! Local-directory metadata backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use airlift_core::config::StorageConfig;
use airlift_core::{Metadata, MirrorError, Result};

use super::{Backend, METADATA_PATH};

/// Backend reading and writing metadata under a plain directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    dir: PathBuf,
}

impl LocalBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(LocalBackend { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn object_path(&self, path: &str) -> PathBuf {
        self.dir.join(path)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn read_metadata(&self) -> Result<Metadata> {
        let path = self.object_path(METADATA_PATH);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MirrorError::MetadataNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    async fn write_metadata(&self, meta: &Metadata) -> Result<()> {
        let data = serde_json::to_vec_pretty(meta)?;
        self.write_object(METADATA_PATH, &data).await
    }

    async fn read_object(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.object_path(path);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                MirrorError::MetadataNotFound(path.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_object(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    fn writer(&self, path: &str) -> Result<std::fs::File> {
        let path = self.object_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::File::create(path)?)
    }

    fn check_config(&self, storage: &StorageConfig) -> Result<()> {
        if storage.registry.is_some() {
            return Err(MirrorError::Config(
                "storage configuration declares a registry backend".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::PastMirror;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_missing_metadata() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();
        let err = backend.read_metadata().await.unwrap_err();
        assert!(matches!(err, MirrorError::MetadataNotFound(_)));
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();

        let mut meta = Metadata::new();
        meta.record(PastMirror::default()).unwrap();
        backend.write_metadata(&meta).await.unwrap();

        let back = backend.read_metadata().await.unwrap();
        assert_eq!(back, meta);
        assert!(tmp.path().join(METADATA_PATH).is_file());
    }

    #[tokio::test]
    async fn test_object_round_trip() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();
        backend
            .write_object("nested/dir/file.bin", b"abc")
            .await
            .unwrap();
        assert_eq!(backend.read_object("nested/dir/file.bin").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_read_missing_object() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();
        assert!(backend.read_object("missing").await.is_err());
    }

    #[test]
    fn test_check_config() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();
        backend.check_config(&StorageConfig::default()).unwrap();

        let mut storage = StorageConfig::default();
        storage.registry = Some(airlift_core::config::RegistryStorage {
            image_url: "reg.local/meta".to_string(),
            skip_tls: false,
        });
        assert!(backend.check_config(&storage).is_err());
    }
}
