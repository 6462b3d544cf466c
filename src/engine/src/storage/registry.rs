//! Registry-as-storage metadata backend.
//!
//! Wraps the local-dir backend: every write lands on disk first, then the
//! result is packaged as a one-file OCI image and pushed to a fixed image
//! URL. Reads pull that image, unpack it into the local directory, and
//! delegate to the local backend.

use std::io::Read;
use std::path::PathBuf;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use airlift_core::config::StorageConfig;
use airlift_core::{ImageReference, Metadata, MirrorError, Result};

use crate::registry::{sha256_digest, RegistryClient};

use super::{Backend, LocalBackend, METADATA_PATH};

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

pub struct RegistryBackend {
    // Image contents are represented locally as files, so the local dir
    // backend does all the r/w; this backend adds the registry round-trip.
    local: LocalBackend,
    image: ImageReference,
    client: RegistryClient,
}

impl RegistryBackend {
    pub fn new(image_url: &str, skip_tls: bool, dir: PathBuf) -> Result<Self> {
        let mut image = ImageReference::parse(image_url)?;
        if image.tag.is_none() && image.digest.is_none() {
            image.tag = Some("latest".to_string());
        }
        Ok(RegistryBackend {
            local: LocalBackend::new(dir)?,
            image,
            client: RegistryClient::new(skip_tls),
        })
    }

    /// The canonical metadata image URL for a workspace on a mirror
    /// registry: `<registry>[/<namespace>]/airlift:<uuid>`.
    pub fn metadata_image_url(mirror_registry: &str, user_namespace: &str, uid: &uuid::Uuid) -> String {
        if user_namespace.is_empty() {
            format!("{mirror_registry}/airlift:{uid}")
        } else {
            format!("{mirror_registry}/{user_namespace}/airlift:{uid}")
        }
    }

    /// Pull the metadata image and unpack its single layer into the local
    /// backing directory.
    async fn unpack(&self) -> Result<()> {
        tracing::debug!(image = %self.image, "checking for existing metadata image");
        let manifest = match self.client.pull_manifest(&self.image).await {
            Ok(m) => m,
            Err(MirrorError::ManifestUnknown(_)) => {
                return Err(MirrorError::MetadataNotFound(self.image.exact()))
            }
            Err(MirrorError::Registry { status: Some(404), reference, .. }) => {
                return Err(MirrorError::MetadataNotFound(reference))
            }
            Err(e) => return Err(e),
        };

        let parsed: serde_json::Value = serde_json::from_slice(&manifest.body)?;
        let layer_digest = parsed
            .get("layers")
            .and_then(|l| l.as_array())
            .and_then(|l| l.first())
            .and_then(|l| l.get("digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| {
                MirrorError::InvalidComponent(format!(
                    "metadata image {} has no layers",
                    self.image.exact()
                ))
            })?;

        let compressed = self.client.pull_blob(&self.image, layer_digest).await?;
        let files = {
            let mut archive = tar::Archive::new(GzDecoder::new(compressed.as_slice()));
            let mut files = Vec::new();
            for entry in archive.entries()? {
                let mut entry = entry?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let path = entry.path()?.to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                files.push((path, data));
            }
            files
        };
        for (path, data) in files {
            self.local.write_object(&path, &data).await?;
        }
        Ok(())
    }

    /// Package `data` at `path` as a one-file OCI image and push it.
    async fn push_image(&self, path: &str, data: &[u8]) -> Result<()> {
        tracing::debug!(image = %self.image, "pushing metadata image");

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, path, data)?;
        let layer = builder
            .into_inner()?
            .finish()
            .map_err(MirrorError::Io)?;

        // The diff_id is the digest of the uncompressed tar stream.
        let mut uncompressed = Vec::new();
        GzDecoder::new(layer.as_slice()).read_to_end(&mut uncompressed)?;
        let diff_id = sha256_digest(&uncompressed);
        let layer_digest = self.client.push_blob(&self.image, &layer).await?;

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {},
            "rootfs": {"type": "layers", "diff_ids": [diff_id]},
        });
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = self.client.push_blob(&self.image, &config_bytes).await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": layer_digest,
                "size": layer.len(),
            }],
        });
        self.client
            .push_manifest(&self.image, serde_json::to_vec(&manifest)?, MANIFEST_MEDIA_TYPE)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RegistryBackend {
    async fn read_metadata(&self) -> Result<Metadata> {
        self.unpack().await?;
        self.local.read_metadata().await
    }

    async fn write_metadata(&self, meta: &Metadata) -> Result<()> {
        let data = serde_json::to_vec_pretty(meta)?;
        self.write_object(METADATA_PATH, &data).await
    }

    async fn read_object(&self, path: &str) -> Result<Vec<u8>> {
        self.local.read_object(path).await
    }

    async fn write_object(&self, path: &str, data: &[u8]) -> Result<()> {
        // Write to disk first so the archive can pick the file up, then
        // mirror the bytes into the registry image.
        self.local.write_object(path, data).await?;
        self.push_image(path, data).await
    }

    fn writer(&self, path: &str) -> Result<std::fs::File> {
        self.local.writer(path)
    }

    fn check_config(&self, storage: &StorageConfig) -> Result<()> {
        if storage.registry.is_none() {
            return Err(MirrorError::Config(
                "storage configuration does not declare a registry backend".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_image_url() {
        let uid = uuid::Uuid::nil();
        assert_eq!(
            RegistryBackend::metadata_image_url("registry.local:5000", "", &uid),
            format!("registry.local:5000/airlift:{uid}")
        );
        assert_eq!(
            RegistryBackend::metadata_image_url("registry.local:5000", "team", &uid),
            format!("registry.local:5000/team/airlift:{uid}")
        );
    }

    #[test]
    fn test_new_defaults_tag() {
        let tmp = TempDir::new().unwrap();
        let backend =
            RegistryBackend::new("registry.local:5000/meta", false, tmp.path().to_path_buf())
                .unwrap();
        assert_eq!(backend.image.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_check_config_requires_registry() {
        let tmp = TempDir::new().unwrap();
        let backend =
            RegistryBackend::new("registry.local:5000/meta", false, tmp.path().to_path_buf())
                .unwrap();
        assert!(backend.check_config(&StorageConfig::default()).is_err());

        let mut storage = StorageConfig::default();
        storage.registry = Some(airlift_core::config::RegistryStorage {
            image_url: "registry.local:5000/meta".to_string(),
            skip_tls: false,
        });
        backend.check_config(&storage).unwrap();
    }
}
