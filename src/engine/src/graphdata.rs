//! Cincinnati graph-data staging and image assembly.
//!
//! The create phase downloads the upstream graph-data archive into the
//! workspace; the publish phase wraps it into a single-layer image whose
//! content lives under the Cincinnati data mount path and pushes it to
//! the mirror so a disconnected update service can serve the graph.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use airlift_core::{ImageKind, ImageReference, MirrorError, Result};

use crate::plan::Mapping;
use crate::registry::{sha256_digest, RegistryClient};

/// Upstream graph-data archive.
pub const GRAPH_DATA_URL: &str = "https://api.openshift.com/api/upgrades_info/graph-data";

/// Workspace path the archive is staged at.
pub const GRAPH_ARCHIVE_PATH: &str = "graph-data/cincinnati-graph-data.tar";

/// Repository the graph image is pushed under on the mirror.
pub const GRAPH_IMAGE_REPO: &str = "openshift/graph-image";

/// Mount path the update service expects the data at.
const GRAPH_DATA_MOUNT: &str = "/var/lib/cincinnati/graph-data";

/// Download the graph-data archive into `src_dir`, returning its path.
pub async fn stage_graph_data(src_dir: &Path) -> Result<PathBuf> {
    let target = src_dir.join(GRAPH_ARCHIVE_PATH);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::info!(url = GRAPH_DATA_URL, "downloading cincinnati graph data");
    let response = reqwest::get(GRAPH_DATA_URL)
        .await
        .map_err(|e| MirrorError::Transient(format!("graph data download: {e}")))?;
    if !response.status().is_success() {
        return Err(MirrorError::Transient(format!(
            "graph data download: HTTP {}",
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| MirrorError::Transient(format!("graph data download: {e}")))?;
    tokio::fs::write(&target, &body).await?;
    Ok(target)
}

/// Build the graph-data image from the staged archive and push it to the
/// mirror registry. Returns the mapping recording the pushed image for
/// cluster-manifest generation.
pub async fn build_graph_image(
    registry: &RegistryClient,
    src_dir: &Path,
    mirror_registry: &str,
    user_namespace: &str,
) -> Result<Mapping> {
    let archive = src_dir.join(GRAPH_ARCHIVE_PATH);
    let data = std::fs::read(&archive).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            MirrorError::ArchiveFileNotFound(GRAPH_ARCHIVE_PATH.to_string())
        }
        _ => MirrorError::Io(e),
    })?;

    let repo = if user_namespace.is_empty() {
        GRAPH_IMAGE_REPO.to_string()
    } else {
        format!("{user_namespace}/{GRAPH_IMAGE_REPO}")
    };
    let dest = ImageReference::parse(&format!("{mirror_registry}/{repo}:latest"))?;

    // Re-root the archive entries under the Cincinnati mount path.
    let layer = rebase_archive(&data)?;
    let mut uncompressed = Vec::new();
    GzDecoder::new(layer.as_slice()).read_to_end(&mut uncompressed)?;
    let diff_id = sha256_digest(&uncompressed);

    let layer_digest = registry.push_blob(&dest, &layer).await?;

    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {},
        "rootfs": {"type": "layers", "diff_ids": [diff_id]},
    });
    let config_bytes = serde_json::to_vec(&config)?;
    let config_digest = registry.push_blob(&dest, &config_bytes).await?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_bytes.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer_digest,
            "size": layer.len(),
        }],
    });
    let digest = registry
        .push_manifest(
            &dest,
            serde_json::to_vec(&manifest)?,
            "application/vnd.oci.image.manifest.v1+json",
        )
        .await?;

    tracing::info!(image = %dest, digest = %digest, "pushed graph-data image");
    let mut source = ImageReference::parse(&format!("quay.io/{GRAPH_IMAGE_REPO}:latest"))?;
    source.digest = Some(digest.clone());
    Ok(Mapping::new(
        source,
        dest.pinned_to(&digest),
        ImageKind::GraphData,
    ))
}

// Rewrite every entry of the staged tar under the mount path and gzip
// the result into an image layer.
fn rebase_archive(data: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let rel = path.trim_start_matches("./").trim_start_matches('/');
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let rooted = format!("{}/{rel}", GRAPH_DATA_MOUNT.trim_start_matches('/'));
        builder.append_data(&mut header, rooted, contents.as_slice())?;
    }

    let layer = builder.into_inner()?.finish()?;
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"channels:\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "channels/stable.yaml", data.as_slice())
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_rebase_archive_roots_entries() {
        let layer = rebase_archive(&sample_tar()).unwrap();

        let mut unpacked = tar::Archive::new(GzDecoder::new(layer.as_slice()));
        let paths: Vec<String> = unpacked
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["var/lib/cincinnati/graph-data/channels/stable.yaml"]);
    }

    #[test]
    fn test_rebase_archive_empty() {
        let empty = tar::Builder::new(Vec::new()).into_inner().unwrap();
        let layer = rebase_archive(&empty).unwrap();
        let mut unpacked = tar::Archive::new(GzDecoder::new(layer.as_slice()));
        assert_eq!(unpacked.entries().unwrap().count(), 0);
    }
}
