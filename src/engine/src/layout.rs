//! On-disk image layout for the create-phase workspace.
//!
//! Images land under `v2/<namespace>/<name>/manifests` (manifest bytes
//! named by digest, plus a tag file holding the digest it points at) and
//! `v2/<namespace>/<name>/blobs` (layer bytes named by digest). Blobs are
//! content-addressed, so a blob already present is never rewritten.

use std::path::{Path, PathBuf};

use airlift_core::{ImageReference, MirrorError, Result};

pub const V2_DIR: &str = "v2";

/// File layout rooted at the workspace `src/` directory.
#[derive(Debug, Clone)]
pub struct FileLayout {
    root: PathBuf,
}

impl FileLayout {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(FileLayout { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative image path under the layout: `v2/<namespace>/<name>`.
    pub fn image_path(reference: &ImageReference) -> String {
        if reference.namespace.is_empty() {
            format!("{V2_DIR}/{}", reference.name)
        } else {
            format!("{V2_DIR}/{}/{}", reference.namespace, reference.name)
        }
    }

    fn manifests_dir(&self, image_path: &str) -> PathBuf {
        self.root.join(image_path).join("manifests")
    }

    fn blobs_dir(&self, image_path: &str) -> PathBuf {
        self.root.join(image_path).join("blobs")
    }

    /// Write manifest bytes under their digest; when a tag is given a tag
    /// file holding the digest is written alongside it.
    pub fn write_manifest(
        &self,
        image_path: &str,
        digest: &str,
        tag: Option<&str>,
        body: &[u8],
    ) -> Result<()> {
        let dir = self.manifests_dir(image_path);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(digest), body)?;
        if let Some(tag) = tag {
            std::fs::write(dir.join(tag), digest.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_manifest(&self, image_path: &str, digest: &str) -> Result<Vec<u8>> {
        let path = self.manifests_dir(image_path).join(digest);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MirrorError::ManifestUnknown(format!("{image_path}@{digest}"))
            }
            _ => MirrorError::Io(e),
        })
    }

    /// Resolve a tag file to the digest it references.
    pub fn resolve_tag(&self, image_path: &str, tag: &str) -> Result<String> {
        let path = self.manifests_dir(image_path).join(tag);
        let digest = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MirrorError::ManifestUnknown(format!("{image_path}:{tag}"))
            }
            _ => MirrorError::Io(e),
        })?;
        Ok(digest.trim().to_string())
    }

    pub fn has_manifest(&self, image_path: &str, digest: &str) -> bool {
        self.manifests_dir(image_path).join(digest).is_file()
    }

    /// Write a blob unless an identical one is already present.
    /// Returns true when bytes were actually written.
    pub fn write_blob(&self, image_path: &str, digest: &str, data: &[u8]) -> Result<bool> {
        let dir = self.blobs_dir(image_path);
        let path = dir.join(digest);
        if path.is_file() {
            tracing::debug!(digest = %digest, path = %image_path, "blob already present, skipping");
            return Ok(false);
        }
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&path, data)?;
        Ok(true)
    }

    pub fn has_blob(&self, image_path: &str, digest: &str) -> bool {
        self.blobs_dir(image_path).join(digest).is_file()
    }

    pub fn read_blob(&self, image_path: &str, digest: &str) -> Result<Vec<u8>> {
        let path = self.blobs_dir(image_path).join(digest);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MirrorError::InvalidComponent(format!(
                "blob {digest} not found under {image_path}"
            )),
            _ => MirrorError::Io(e),
        })
    }

    /// Absolute path of a blob file, for callers staging fetched layers.
    pub fn blob_path(&self, image_path: &str, digest: &str) -> PathBuf {
        self.blobs_dir(image_path).join(digest)
    }

    /// Every `(image_path, digest)` pair of blobs present in the layout.
    pub fn list_blobs(&self) -> Result<Vec<(String, String)>> {
        let mut blobs = Vec::new();
        let v2 = self.root.join(V2_DIR);
        if !v2.is_dir() {
            return Ok(blobs);
        }
        for entry in walkdir::WalkDir::new(&v2) {
            let entry = entry.map_err(|e| MirrorError::InvalidComponent(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(parent) = path.parent() else { continue };
            if parent.file_name().and_then(|n| n.to_str()) != Some("blobs") {
                continue;
            }
            let image_dir = parent.parent().unwrap_or(parent);
            let image_path = image_dir
                .strip_prefix(&self.root)
                .unwrap_or(image_dir)
                .to_string_lossy()
                .into_owned();
            let digest = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
            blobs.push((image_path, digest));
        }
        blobs.sort();
        Ok(blobs)
    }

    /// Every manifest file path (relative to the layout root).
    pub fn list_manifests(&self) -> Result<Vec<String>> {
        let mut manifests = Vec::new();
        let v2 = self.root.join(V2_DIR);
        if !v2.is_dir() {
            return Ok(manifests);
        }
        for entry in walkdir::WalkDir::new(&v2) {
            let entry = entry.map_err(|e| MirrorError::InvalidComponent(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let in_manifests = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                == Some("manifests");
            if in_manifests {
                manifests.push(
                    path.strip_prefix(&self.root)
                        .unwrap_or(path)
                        .to_string_lossy()
                        .into_owned(),
                );
            }
        }
        manifests.sort();
        Ok(manifests)
    }
}
