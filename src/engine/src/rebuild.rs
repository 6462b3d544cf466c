//! Catalog image rebuilding.
//!
//! Every rewritten `index.json` discovered under the unarchived
//! `catalogs/` tree is turned back into a catalog image on the mirror:
//! whiteout the original FBC and cache, lay in the new `/configs`,
//! regenerate the catalog server cache, and push the result as a
//! manifest list across the fixed platform set. When the destination
//! already holds a catalog from a prior run the new config is rendered
//! over it so upgrade edges accumulate.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use airlift_core::{DeclarativeConfig, ImageKind, ImageReference, MirrorError, Result};

use crate::operator::{fetch_catalog_configs, CONFIGS_LABEL};
use crate::plan::{Mapping, MappingSet};
use crate::registry::{sha256_digest, RegistryClient};

/// Pinned catalog-server base image used when the destination has no
/// prior catalog to layer onto.
pub const OPM_IMAGE: &str =
    "quay.io/operator-framework/opm@sha256:038007c1c5d5f0efa50961cbcc097c6e63655a2ab4126547e3c4eb620ad0346e";

/// Rebuilt catalogs always span this platform set.
pub const PLATFORMS: &[(&str, &str)] = &[
    ("linux", "amd64"),
    ("linux", "arm64"),
    ("linux", "ppc64le"),
    ("linux", "s390x"),
];

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A catalog discovered in the unarchived tree: the image it should be
/// pushed as, and the directory holding its new declarative config.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredCatalog {
    pub reference: ImageReference,
    pub dc_dir: PathBuf,
}

/// Find every rewritten catalog under `<dst_dir>/catalogs/`. The path
/// below the prefix reads `<registry>/<namespace…>/<name>/<leaf>`, the
/// leaf being a digest when it contains a colon; the registry component
/// is replaced by the mirror so the image can be pulled and pushed
/// there. Unparseable paths are rejected with a diagnostic rather than
/// silently mis-mapped.
pub fn discover_catalogs(dst_dir: &Path, mirror_registry: &str) -> Result<Vec<DiscoveredCatalog>> {
    let root = dst_dir.join("catalogs");
    let mut found = Vec::new();
    if !root.is_dir() {
        return Ok(found);
    }

    for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| MirrorError::Archive {
            path: root.clone(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file()
            || entry.file_name().to_str() != Some("index.json")
        {
            continue;
        }
        let dc_dir = entry.path().parent().unwrap_or(entry.path()).to_path_buf();
        let rel = dc_dir
            .strip_prefix(&root)
            .map_err(|e| MirrorError::InvalidComponent(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        let (repo_path, leaf) = rel.rsplit_once('/').ok_or_else(|| {
            MirrorError::InvalidComponent(format!(
                "catalog path {rel:?} does not name a repository and tag or digest"
            ))
        })?;
        // Drop the source registry component, keep namespace/name.
        let repo = match repo_path.split_once('/') {
            Some((_registry, rest)) => rest,
            None => {
                return Err(MirrorError::InvalidComponent(format!(
                    "catalog path {rel:?} does not carry a registry prefix"
                )))
            }
        };

        let image = if leaf.contains(':') {
            format!("{mirror_registry}/{repo}@{leaf}")
        } else {
            format!("{mirror_registry}/{repo}:{leaf}")
        };
        let reference = ImageReference::parse(&image).map_err(|e| {
            MirrorError::InvalidComponent(format!(
                "catalog index path {} does not map to an image: {e}",
                entry.path().display()
            ))
        })?;
        found.push(DiscoveredCatalog { reference, dc_dir });
    }
    Ok(found)
}

pub struct CatalogRebuilder<'a> {
    registry: &'a RegistryClient,
    /// Scratch directory for merged renders and the regenerated cache
    build_dir: PathBuf,
    /// Catalog server binary for cache regeneration
    opm_binary: String,
}

impl<'a> CatalogRebuilder<'a> {
    pub fn new(registry: &'a RegistryClient, build_dir: impl Into<PathBuf>) -> Self {
        CatalogRebuilder {
            registry,
            build_dir: build_dir.into(),
            opm_binary: "opm".to_string(),
        }
    }

    pub fn with_opm_binary(mut self, binary: impl Into<String>) -> Self {
        self.opm_binary = binary.into();
        self
    }

    /// Rebuild every discovered catalog. A build failure is fatal for
    /// that catalog only; the rest proceed and the failures come back
    /// aggregated beside the successful mappings.
    pub async fn rebuild_all(
        &self,
        catalogs: &[DiscoveredCatalog],
    ) -> (MappingSet, Option<MirrorError>) {
        let mut mappings = MappingSet::new();
        let mut errs = Vec::new();
        for catalog in catalogs {
            match self.rebuild(catalog).await {
                Ok(mapping) => mappings.add(mapping),
                Err(e) => {
                    tracing::error!(catalog = %catalog.reference, error = %e, "catalog rebuild failed");
                    errs.push(MirrorError::Build {
                        reference: catalog.reference.exact(),
                        message: e.to_string(),
                    });
                }
            }
        }
        (mappings, MirrorError::aggregate(errs))
    }

    async fn rebuild(&self, catalog: &DiscoveredCatalog) -> Result<Mapping> {
        let dest = &catalog.reference;
        let new_dc = DeclarativeConfig::load_dir(&catalog.dc_dir)?;

        // When a prior generation already lives on the mirror, render the
        // new config over it; otherwise build atop the catalog server
        // base image.
        let scratch = self.build_dir.join(dest.repository().replace('/', "_"));
        let (dc, base) = match self.registry.resolve(dest).await {
            Ok(_) => {
                tracing::info!(catalog = %dest, "existing catalog found, rendering with new file-based catalog");
                let old_dir = scratch.join("previous");
                std::fs::create_dir_all(&old_dir)?;
                fetch_catalog_configs(self.registry, dest, &old_dir, None).await?;
                let old_dc = DeclarativeConfig::load_dir(&old_dir)?;
                (old_dc.merge(new_dc), dest.clone())
            }
            Err(MirrorError::ManifestUnknown(_)) => {
                tracing::info!(catalog = %dest, "no existing catalog, using new file-based catalog");
                (new_dc, ImageReference::parse(OPM_IMAGE)?)
            }
            Err(e) => return Err(e),
        };

        let configs_dir = scratch.join("configs");
        std::fs::create_dir_all(&configs_dir)?;
        dc.write_json(&configs_dir)?;

        let cache_dir = scratch.join("cache");
        self.regenerate_cache(dest, &configs_dir, &cache_dir).await?;

        let digest = self.assemble_and_push(dest, &base, &configs_dir, &cache_dir).await?;
        tracing::info!(catalog = %dest, digest = %digest, "pushed rebuilt catalog");

        // The source side of the mapping is the catalog's original
        // identity; the destination records the pushed digest for ICSP
        // generation.
        Ok(Mapping::new(
            dest.clone(),
            dest.pinned_to(&digest),
            ImageKind::OperatorCatalog,
        ))
    }

    // `opm serve <configs> --cache-dir <dir> --cache-only` regenerates
    // the on-disk cache the catalog server mmaps at startup.
    async fn regenerate_cache(
        &self,
        dest: &ImageReference,
        configs_dir: &Path,
        cache_dir: &Path,
    ) -> Result<()> {
        std::fs::create_dir_all(cache_dir)?;
        let build_err = |message: String| MirrorError::Build {
            reference: dest.exact(),
            message,
        };

        let output = tokio::process::Command::new(&self.opm_binary)
            .arg("serve")
            .arg(configs_dir)
            .arg(format!("--cache-dir={}", cache_dir.display()))
            .arg("--cache-only")
            .output()
            .await
            .map_err(|e| build_err(format!("running {}: {e}", self.opm_binary)))?;
        if !output.status.success() {
            return Err(build_err(format!(
                "{} exited with {}: {}",
                self.opm_binary,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn assemble_and_push(
        &self,
        dest: &ImageReference,
        base: &ImageReference,
        configs_dir: &Path,
        cache_dir: &Path,
    ) -> Result<String> {
        // Base manifest and config to layer onto.
        let base_manifest = self.registry.pull_manifest(base).await?;
        let base_body = if base_manifest.is_list() {
            let parsed: serde_json::Value = serde_json::from_slice(&base_manifest.body)?;
            let child = crate::mirror::child_digests(&parsed)
                .into_iter()
                .next()
                .ok_or_else(|| MirrorError::Build {
                    reference: dest.exact(),
                    message: format!("base image {} has an empty manifest list", base.exact()),
                })?;
            self.registry.pull_manifest(&base.pinned_to(&child)).await?.body
        } else {
            base_manifest.body
        };
        let mut manifest: serde_json::Value = serde_json::from_slice(&base_body)?;
        let base_config_digest = manifest
            .get("config")
            .and_then(|c| c.get("digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| MirrorError::Build {
                reference: dest.exact(),
                message: "base manifest has no config".to_string(),
            })?
            .to_string();
        let mut config: serde_json::Value =
            serde_json::from_slice(&self.registry.pull_blob(base, &base_config_digest).await?)?;

        // Base layers must exist at the destination too.
        for digest in crate::mirror::blob_digests_of(&base_body)? {
            if digest == base_config_digest {
                continue;
            }
            let data = self.registry.pull_blob(base, &digest).await?;
            self.registry.push_blob(dest, &data).await?;
        }

        // Three appended layers: whiteouts, the new configs, the cache.
        let whiteout = build_layer(&[
            ("configs/.wh.index.json", Vec::new()),
            ("tmp/.wh.cache", Vec::new()),
        ])?;
        let configs = dir_layer(configs_dir, "configs")?;
        let cache = dir_layer(cache_dir, "tmp/cache")?;

        for layer in [&whiteout, &configs, &cache] {
            self.registry.push_blob(dest, &layer.compressed).await?;
            append_layer(&mut manifest, &mut config, layer)?;
        }

        // Catalog server runtime configuration.
        let runtime = config
            .get_mut("config")
            .and_then(|c| c.as_object_mut())
            .ok_or_else(|| MirrorError::Build {
                reference: dest.exact(),
                message: "base config has no runtime section".to_string(),
            })?;
        runtime
            .entry("Labels")
            .or_insert_with(|| serde_json::json!({}))
            .as_object_mut()
            .map(|labels| {
                labels.insert(CONFIGS_LABEL.to_string(), serde_json::json!("/configs"))
            });
        runtime.insert("Entrypoint".to_string(), serde_json::json!(["opm"]));
        runtime.insert("Cmd".to_string(), serde_json::json!(["serve", "/configs"]));

        // Push config, one platform-shared manifest, then the index.
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = self.registry.push_blob(dest, &config_bytes).await?;
        if let Some(c) = manifest.get_mut("config") {
            c["digest"] = serde_json::json!(config_digest);
            c["size"] = serde_json::json!(config_bytes.len());
        }
        manifest["mediaType"] = serde_json::json!(MANIFEST_MEDIA_TYPE);

        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_digest = sha256_digest(&manifest_bytes);
        let child_dest = ImageReference {
            tag: None,
            digest: Some(manifest_digest.clone()),
            ..dest.clone()
        };
        self.registry
            .push_manifest(&child_dest, manifest_bytes.clone(), MANIFEST_MEDIA_TYPE)
            .await?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": INDEX_MEDIA_TYPE,
            "manifests": PLATFORMS
                .iter()
                .map(|(os, arch)| {
                    serde_json::json!({
                        "mediaType": MANIFEST_MEDIA_TYPE,
                        "digest": manifest_digest,
                        "size": manifest_bytes.len(),
                        "platform": {"os": os, "architecture": arch},
                    })
                })
                .collect::<Vec<_>>(),
        });
        self.registry
            .push_manifest(dest, serde_json::to_vec(&index)?, INDEX_MEDIA_TYPE)
            .await
    }
}

struct BuiltLayer {
    compressed: Vec<u8>,
    digest: String,
    diff_id: String,
}

fn build_layer(entries: &[(&str, Vec<u8>)]) -> Result<BuiltLayer> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    let plain = builder.into_inner()?;
    let diff_id = sha256_digest(&plain);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &plain)?;
    let compressed = encoder.finish()?;
    let digest = sha256_digest(&compressed);
    Ok(BuiltLayer {
        compressed,
        digest,
        diff_id,
    })
}

// Layer containing every file under `dir`, rooted at `root` inside the
// image.
fn dir_layer(dir: &Path, root: &str) -> Result<BuiltLayer> {
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| MirrorError::Archive {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| MirrorError::InvalidComponent(e.to_string()))?;
        entries.push((
            format!("{root}/{}", rel.to_string_lossy()),
            std::fs::read(entry.path())?,
        ));
    }
    let borrowed: Vec<(&str, Vec<u8>)> = entries
        .iter()
        .map(|(p, d)| (p.as_str(), d.clone()))
        .collect();
    build_layer(&borrowed)
}

fn append_layer(
    manifest: &mut serde_json::Value,
    config: &mut serde_json::Value,
    layer: &BuiltLayer,
) -> Result<()> {
    let layers = manifest
        .get_mut("layers")
        .and_then(|l| l.as_array_mut())
        .ok_or_else(|| MirrorError::Serialization("manifest has no layers array".to_string()))?;
    layers.push(serde_json::json!({
        "mediaType": LAYER_MEDIA_TYPE,
        "digest": layer.digest,
        "size": layer.compressed.len(),
    }));

    let diff_ids = config
        .get_mut("rootfs")
        .and_then(|r| r.get_mut("diff_ids"))
        .and_then(|d| d.as_array_mut())
        .ok_or_else(|| MirrorError::Serialization("config has no diff_ids".to_string()))?;
    diff_ids.push(serde_json::json!(layer.diff_id));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_discover_catalogs() {
        let tmp = TempDir::new().unwrap();
        let tag_dir = tmp
            .path()
            .join("catalogs/registry.redhat.io/redhat/operator-index/v4.9");
        std::fs::create_dir_all(&tag_dir).unwrap();
        std::fs::write(tag_dir.join("index.json"), b"{}").unwrap();

        let digest_dir = tmp
            .path()
            .join("catalogs/quay.io/other/catalog/sha256:abc");
        std::fs::create_dir_all(&digest_dir).unwrap();
        std::fs::write(digest_dir.join("index.json"), b"{}").unwrap();

        let found = discover_catalogs(tmp.path(), "registry.local:5000").unwrap();
        assert_eq!(found.len(), 2);

        let by_tag = found
            .iter()
            .find(|c| c.reference.tag.is_some())
            .unwrap();
        assert_eq!(
            by_tag.reference.exact(),
            "registry.local:5000/redhat/operator-index:v4.9"
        );
        let by_digest = found
            .iter()
            .find(|c| c.reference.digest.is_some())
            .unwrap();
        assert_eq!(
            by_digest.reference.exact(),
            "registry.local:5000/other/catalog@sha256:abc"
        );
    }

    #[test]
    fn test_discover_catalogs_empty_tree() {
        let tmp = TempDir::new().unwrap();
        assert!(discover_catalogs(tmp.path(), "registry.local").unwrap().is_empty());
    }

    #[test]
    fn test_discover_catalogs_rejects_shallow_path() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("catalogs/v4.9");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("index.json"), b"{}").unwrap();
        let err = discover_catalogs(tmp.path(), "registry.local").unwrap_err();
        assert!(matches!(err, MirrorError::InvalidComponent(_)));
    }

    #[test]
    fn test_build_layer_digests() {
        let layer = build_layer(&[("configs/index.json", b"{}".to_vec())]).unwrap();
        assert!(layer.digest.starts_with("sha256:"));
        assert!(layer.diff_id.starts_with("sha256:"));
        assert_ne!(layer.digest, layer.diff_id);

        // The compressed bytes round-trip to the diff_id.
        let mut plain = Vec::new();
        GzDecoder::new(layer.compressed.as_slice())
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(sha256_digest(&plain), layer.diff_id);
    }

    #[test]
    fn test_dir_layer_roots_entries() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.json"), b"{}").unwrap();
        let layer = dir_layer(tmp.path(), "configs").unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(layer.compressed.as_slice()));
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["configs/index.json"]);
    }

    #[test]
    fn test_append_layer() {
        let mut manifest = serde_json::json!({"layers": []});
        let mut config = serde_json::json!({"rootfs": {"diff_ids": []}});
        let layer = build_layer(&[("f", b"x".to_vec())]).unwrap();
        append_layer(&mut manifest, &mut config, &layer).unwrap();
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 1);
        assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_platform_set_is_fixed() {
        assert_eq!(PLATFORMS.len(), 4);
        assert!(PLATFORMS.iter().all(|(os, _)| *os == "linux"));
    }
}
