//! Operator catalog planning.
//!
//! For each declared catalog: pull the catalog image, locate its
//! file-based catalog via the config label, load and filter/diff the
//! declarative config, pin every image to a digest, write the rewritten
//! catalog under `catalogs/…/index.json`, and emit bundle and
//! related-image mappings into the master plan.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;

use airlift_core::config::{ImageSetConfiguration, Operator};
use airlift_core::{
    CatalogProvenance, DeclarativeConfig, ImageKind, ImageReference, Metadata, MirrorError,
    Result, Transport,
};

pub mod diff;
pub mod filter;
pub mod pin;

use crate::context::LayerCache;
use crate::plan::{Mapping, MappingSet};
use crate::registry::RegistryClient;
use crate::release::to_file_destination;

use filter::CatalogFilter;

/// Config label naming the catalog's FBC directory inside the image.
pub const CONFIGS_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

/// Default FBC location when the label is absent.
const DEFAULT_CONFIGS_PATH: &str = "/configs";

/// Planner output for all catalogs.
#[derive(Debug, Default)]
pub struct CatalogPlan {
    pub mappings: MappingSet,
    pub provenance: Vec<CatalogProvenance>,
    /// Directories holding the rewritten index.json files
    pub index_dirs: Vec<PathBuf>,
}

pub struct CatalogPlanner<'a> {
    registry: &'a RegistryClient,
    /// Workspace `src/` directory the rewritten catalogs land under
    src_dir: PathBuf,
    /// Scratch directory for catalog extraction
    working_dir: PathBuf,
    skip_image_pin: bool,
    /// Run-scoped cache deduplicating layer pulls across generations
    layer_cache: Option<&'a LayerCache>,
}

impl<'a> CatalogPlanner<'a> {
    pub fn new(
        registry: &'a RegistryClient,
        src_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        skip_image_pin: bool,
    ) -> Self {
        CatalogPlanner {
            registry,
            src_dir: src_dir.into(),
            working_dir: working_dir.into(),
            skip_image_pin,
            layer_cache: None,
        }
    }

    pub fn with_layer_cache(mut self, cache: &'a LayerCache) -> Self {
        self.layer_cache = Some(cache);
        self
    }

    /// Plan every declared catalog. Per-catalog failures are aggregated so
    /// one broken catalog does not hide the rest.
    pub async fn plan(
        &self,
        cfg: &ImageSetConfiguration,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<CatalogPlan> {
        let mut plan = CatalogPlan::default();
        let mut errs = Vec::new();

        for ctlg in &cfg.mirror.operators {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            match self.plan_catalog(ctlg, metadata).await {
                Ok(one) => {
                    plan.mappings.merge(one.mappings);
                    plan.provenance.extend(one.provenance);
                    plan.index_dirs.extend(one.index_dirs);
                }
                Err(e) => errs.push(e),
            }
        }

        match MirrorError::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(plan),
        }
    }

    async fn plan_catalog(&self, ctlg: &Operator, metadata: &Metadata) -> Result<CatalogPlan> {
        let ctlg_ref = ImageReference::parse(&ctlg.catalog)?;
        tracing::info!(catalog = %ctlg_ref, "planning operator catalog");

        let filter = CatalogFilter::from_include(&ctlg.include_config)?;
        let fingerprint = if filter.is_empty() {
            None
        } else {
            Some(filter.fingerprint()?)
        };

        let catalog_digest = match ctlg_ref.transport {
            Transport::OciLayout => None,
            _ => Some(self.registry.resolve(&ctlg_ref).await?),
        };

        let mut plan = CatalogPlan::default();
        let provenance = CatalogProvenance {
            catalog: ctlg.catalog.clone(),
            image_pin: catalog_digest.clone(),
            filter_fingerprint: fingerprint.clone(),
        };

        // Unchanged generation with an unchanged filter produces an empty
        // diff; only the catalog image itself needs (re)mirroring.
        let prior = metadata.catalog_provenance(&ctlg.catalog);
        if let (Some(prior), Some(digest)) = (prior, &catalog_digest) {
            if prior.image_pin.as_deref() == Some(digest.as_str())
                && prior.filter_fingerprint == fingerprint
            {
                tracing::info!(
                    catalog = %ctlg_ref,
                    digest = %digest,
                    "catalog unchanged since last run, skipping render"
                );
                plan.mappings
                    .add(self.catalog_mapping(&ctlg_ref, catalog_digest.clone()));
                plan.provenance.push(provenance);
                return Ok(plan);
            }
        }

        let leaf = catalog_leaf(&ctlg_ref, ctlg)?;

        // Pull and load the current catalog generation.
        let extract_dir = self.extract_dir(&ctlg_ref, &leaf, "current")?;
        fetch_catalog_configs(self.registry, &ctlg_ref, &extract_dir, self.layer_cache).await?;
        let mut dc = DeclarativeConfig::load_dir(&extract_dir)?;

        // Narrow: explicit filter wins, otherwise heads-only unless the
        // full catalog was requested.
        dc = if !filter.is_empty() {
            filter.apply(dc)
        } else if ctlg.full {
            dc
        } else {
            filter::retain_heads(dc)
        };

        // A prior pin turns the render into a generation diff.
        if let Some(old_pin) = prior.and_then(|p| p.image_pin.clone()) {
            if Some(&old_pin) != catalog_digest.as_ref() {
                let old_ref = ctlg_ref.pinned_to(&old_pin);
                let old_dir = self.extract_dir(&ctlg_ref, &leaf, "previous")?;
                fetch_catalog_configs(self.registry, &old_ref, &old_dir, self.layer_cache).await?;
                let mut old_dc = DeclarativeConfig::load_dir(&old_dir)?;
                old_dc = if !filter.is_empty() {
                    filter.apply(old_dc)
                } else if ctlg.full {
                    old_dc
                } else {
                    filter::retain_heads(old_dc)
                };
                dc = diff::diff(&old_dc, &dc);
            }
        }

        if !self.skip_image_pin {
            if let Err(err) = pin::pin_images(&mut dc, self.registry).await {
                // Pinning failures degrade the catalog but are not fatal
                // to the whole plan.
                tracing::warn!(catalog = %ctlg_ref, error = %err, "image pinning incomplete");
            }
        }

        let index_dir = self.index_dir(&ctlg_ref, &leaf)?;
        dc.write_json(&index_dir)?;
        plan.index_dirs.push(index_dir);

        // A local oci-layout catalog is already on disk; only registry
        // catalogs are copied into the layout.
        if ctlg_ref.transport != Transport::OciLayout {
            plan.mappings.add(self.catalog_mapping(&ctlg_ref, catalog_digest));
        }
        for bundle in &dc.bundles {
            if !bundle.image.is_empty() {
                let source = ImageReference::parse(&bundle.image)?;
                plan.mappings.add(Mapping::new(
                    source.clone(),
                    scoped_file_destination(&source)?,
                    ImageKind::OperatorBundle,
                ));
            }
            for related in &bundle.related_images {
                if related.image.is_empty() {
                    continue;
                }
                let source = ImageReference::parse(&related.image)?;
                plan.mappings.add(Mapping::new(
                    source.clone(),
                    scoped_file_destination(&source)?,
                    ImageKind::OperatorRelated,
                ));
            }
        }

        plan.provenance.push(provenance);
        Ok(plan)
    }

    fn catalog_mapping(&self, ctlg_ref: &ImageReference, digest: Option<String>) -> Mapping {
        let mut source = ctlg_ref.clone();
        if source.digest.is_none() {
            source.digest = digest;
        }
        Mapping::new(
            source.clone(),
            to_file_destination(&source),
            ImageKind::OperatorCatalog,
        )
    }

    // Workspace directory a catalog generation is extracted into, keyed
    // by the full reference so parallel catalogs never collide.
    fn extract_dir(&self, ctlg_ref: &ImageReference, leaf: &str, generation: &str) -> Result<PathBuf> {
        let dir = self
            .working_dir
            .join("catalogs")
            .join(&ctlg_ref.registry)
            .join(ctlg_ref.repository())
            .join(leaf.replace(':', "_"))
            .join(generation);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    // `src/catalogs/<registry>/<namespace>/<name>/<leaf>` for the
    // rewritten index.json.
    fn index_dir(&self, ctlg_ref: &ImageReference, leaf: &str) -> Result<PathBuf> {
        let dir = self
            .src_dir
            .join("catalogs")
            .join(&ctlg_ref.registry)
            .join(ctlg_ref.repository())
            .join(leaf);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

}

/// Pull a catalog image and extract its FBC directory into `dest`.
pub async fn fetch_catalog_configs(
    registry: &RegistryClient,
    ctlg_ref: &ImageReference,
    dest: &Path,
    cache: Option<&LayerCache>,
) -> Result<()> {
    let (config_bytes, layers) = match ctlg_ref.transport {
        Transport::OciLayout => read_local_catalog(ctlg_ref)?,
        _ => pull_remote_catalog(registry, ctlg_ref, cache).await?,
    };

    let configs_path = configs_label(&config_bytes)?;
    let prefix = configs_path.trim_start_matches('/');

    let mut found = false;
    for layer in &layers {
        found |= extract_prefixed(layer, prefix, dest)?;
    }
    if !found {
        return Err(MirrorError::InvalidComponent(format!(
            "catalog {} has no {configs_path} directory in any layer",
            ctlg_ref.exact()
        )));
    }
    Ok(())
}

async fn pull_remote_catalog(
    registry: &RegistryClient,
    ctlg_ref: &ImageReference,
    cache: Option<&LayerCache>,
) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
    let manifest = registry.pull_manifest(ctlg_ref).await?;
    let body = if manifest.is_list() {
        let parsed: serde_json::Value = serde_json::from_slice(&manifest.body)?;
        let child = crate::mirror::child_digests(&parsed)
            .into_iter()
            .next()
            .ok_or_else(|| {
                MirrorError::InvalidComponent(format!(
                    "catalog {} manifest list is empty",
                    ctlg_ref.exact()
                ))
            })?;
        registry.pull_manifest(&ctlg_ref.pinned_to(&child)).await?.body
    } else {
        manifest.body
    };

    let parsed: serde_json::Value = serde_json::from_slice(&body)?;
    let config_digest = parsed
        .get("config")
        .and_then(|c| c.get("digest"))
        .and_then(|d| d.as_str())
        .ok_or_else(|| {
            MirrorError::InvalidComponent(format!(
                "catalog {} manifest has no config",
                ctlg_ref.exact()
            ))
        })?;
    let config_bytes = registry.pull_blob(ctlg_ref, config_digest).await?;

    let mut layers = Vec::new();
    for digest in parsed
        .get("layers")
        .and_then(|l| l.as_array())
        .into_iter()
        .flatten()
        .filter_map(|l| l.get("digest").and_then(|d| d.as_str()))
    {
        if let Some(data) = cache.and_then(|c| c.get(digest)) {
            layers.push(data);
            continue;
        }
        let data = registry.pull_blob(ctlg_ref, digest).await?;
        if let Some(cache) = cache {
            cache.put(digest, &data)?;
        }
        layers.push(data);
    }
    Ok((config_bytes, layers))
}

// The leaf path segment keying a catalog in the workspace: the target
// tag when declared, the reference's tag or digest otherwise, and the
// layout directory name for local oci catalogs.
fn catalog_leaf(ctlg_ref: &ImageReference, ctlg: &Operator) -> Result<String> {
    if let Some(tag) = &ctlg.target_tag {
        return Ok(tag.clone());
    }
    match ctlg_ref.leaf() {
        Ok(leaf) => Ok(leaf),
        Err(_) if ctlg_ref.transport == Transport::OciLayout && !ctlg_ref.name.is_empty() => {
            Ok(ctlg_ref.name.clone())
        }
        Err(e) => Err(e),
    }
}

/// Bundle and related images land at `<namespace>/<name>` in the layout,
/// capped to the final two path components so the catalog namespace is
/// not repeated in the destination.
pub fn scoped_file_destination(source: &ImageReference) -> Result<ImageReference> {
    let mut dest = to_file_destination(source);
    let repository = source.repository();
    let components: Vec<&str> = repository
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    match components.len() {
        0 => {
            return Err(MirrorError::InvalidComponent(format!(
                "image {} has an empty repository path",
                source.full()
            )))
        }
        1 => {
            dest.namespace = String::new();
            dest.name = components[0].to_string();
        }
        n => {
            dest.namespace = components[n - 2].to_string();
            dest.name = components[n - 1].to_string();
        }
    }
    Ok(dest)
}

// Read the FBC path label out of an image config.
fn configs_label(config_bytes: &[u8]) -> Result<String> {
    let parsed: serde_json::Value = serde_json::from_slice(config_bytes)?;
    Ok(parsed
        .get("config")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.get(CONFIGS_LABEL))
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_CONFIGS_PATH)
        .to_string())
}

// Extract regular files under `prefix` from a (possibly gzipped) tar
// layer into `dest`, stripping the prefix. Returns whether anything
// matched.
fn extract_prefixed(layer: &[u8], prefix: &str, dest: &Path) -> Result<bool> {
    let reader: Box<dyn Read> = if layer.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(layer))
    } else {
        Box::new(layer)
    };
    let mut archive = tar::Archive::new(reader);
    let mut found = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let trimmed = path.trim_start_matches("./");
        let Some(rel) = trimmed.strip_prefix(prefix) else {
            continue;
        };
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        std::fs::write(&target, data)?;
        found = true;
    }
    Ok(found)
}

// Local OCI layout: index.json -> manifest -> config + layer blobs.
fn read_local_catalog(ctlg_ref: &ImageReference) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
    let root = ctlg_ref.layout_path.as_ref().ok_or_else(|| {
        MirrorError::Reference {
            reference: ctlg_ref.full(),
            message: "oci layout reference has no path".to_string(),
        }
    })?;

    let read_blob = |digest: &str| -> Result<Vec<u8>> {
        let (algo, hex) = digest.split_once(':').ok_or_else(|| {
            MirrorError::InvalidComponent(format!("malformed digest {digest}"))
        })?;
        Ok(std::fs::read(root.join("blobs").join(algo).join(hex))?)
    };

    let index: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("index.json"))?)?;
    let manifest_digest = index
        .get("manifests")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
        .and_then(|m| m.get("digest"))
        .and_then(|d| d.as_str())
        .ok_or_else(|| {
            MirrorError::InvalidComponent(format!(
                "oci layout {} has an empty index",
                root.display()
            ))
        })?;

    let mut manifest: serde_json::Value = serde_json::from_slice(&read_blob(manifest_digest)?)?;
    // A nested index points at the platform manifest.
    if let Some(child) = manifest
        .get("manifests")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
        .and_then(|m| m.get("digest"))
        .and_then(|d| d.as_str())
    {
        manifest = serde_json::from_slice(&read_blob(child)?)?;
    }

    let config_digest = manifest
        .get("config")
        .and_then(|c| c.get("digest"))
        .and_then(|d| d.as_str())
        .ok_or_else(|| {
            MirrorError::InvalidComponent(format!(
                "oci layout {} manifest has no config",
                root.display()
            ))
        })?;
    let config_bytes = read_blob(config_digest)?;

    let mut layers = Vec::new();
    for digest in manifest
        .get("layers")
        .and_then(|l| l.as_array())
        .into_iter()
        .flatten()
        .filter_map(|l| l.get("digest").and_then(|d| d.as_str()))
    {
        layers.push(read_blob(digest)?);
    }
    Ok((config_bytes, layers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    #[test]
    fn test_scoped_file_destination_strips_to_two_components() {
        let deep = ImageReference::parse("quay.io/catalog/org/app/bundle:v1").unwrap();
        let dest = scoped_file_destination(&deep).unwrap();
        assert_eq!(dest.namespace, "app");
        assert_eq!(dest.name, "bundle");
        assert_eq!(dest.transport, Transport::File);

        let shallow = ImageReference::parse("quay.io/ns/app:v1").unwrap();
        let dest = scoped_file_destination(&shallow).unwrap();
        assert_eq!(dest.namespace, "ns");
        assert_eq!(dest.name, "app");
    }

    #[test]
    fn test_configs_label_default() {
        let config = serde_json::json!({"config": {"Labels": {}}});
        let label = configs_label(&serde_json::to_vec(&config).unwrap()).unwrap();
        assert_eq!(label, "/configs");
    }

    #[test]
    fn test_configs_label_from_image() {
        let config = serde_json::json!({
            "config": {"Labels": {CONFIGS_LABEL: "/fbc"}}
        });
        let label = configs_label(&serde_json::to_vec(&config).unwrap()).unwrap();
        assert_eq!(label, "/fbc");
    }

    fn layer_with(entries: &[(&str, &[u8])], gzip: bool) -> Vec<u8> {
        let build = |w: &mut tar::Builder<Vec<u8>>| {
            for (path, data) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                w.append_data(&mut header, path, *data).unwrap();
            }
        };
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        let plain = builder.into_inner().unwrap();
        if gzip {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            std::io::Write::write_all(&mut enc, &plain).unwrap();
            enc.finish().unwrap()
        } else {
            plain
        }
    }

    #[test]
    fn test_extract_prefixed_strips_prefix() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_with(
            &[
                ("configs/etcd/index.json", br#"{"schema":"olm.package","name":"etcd"}"#),
                ("etc/unrelated", b"x"),
            ],
            true,
        );
        let found = extract_prefixed(&layer, "configs", tmp.path()).unwrap();
        assert!(found);
        assert!(tmp.path().join("etcd/index.json").is_file());
        assert!(!tmp.path().join("etc/unrelated").exists());
    }

    #[test]
    fn test_extract_prefixed_plain_tar() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_with(&[("configs/pkg/index.json", b"{}")], false);
        assert!(extract_prefixed(&layer, "configs", tmp.path()).unwrap());
    }

    #[test]
    fn test_extract_prefixed_no_match() {
        let tmp = TempDir::new().unwrap();
        let layer = layer_with(&[("other/file", b"x")], true);
        assert!(!extract_prefixed(&layer, "configs", tmp.path()).unwrap());
    }

    #[test]
    fn test_read_local_catalog() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("catalog");
        let blobs = root.join("blobs/sha256");
        std::fs::create_dir_all(&blobs).unwrap();

        let layer = layer_with(&[("configs/pkg/index.json", b"{}")], true);
        let layer_digest = crate::registry::sha256_digest(&layer);
        std::fs::write(blobs.join(layer_digest.trim_start_matches("sha256:")), &layer).unwrap();

        let config = serde_json::json!({"config": {"Labels": {CONFIGS_LABEL: "/configs"}}});
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = crate::registry::sha256_digest(&config_bytes);
        std::fs::write(
            blobs.join(config_digest.trim_start_matches("sha256:")),
            &config_bytes,
        )
        .unwrap();

        let manifest = serde_json::json!({
            "config": {"digest": config_digest},
            "layers": [{"digest": layer_digest}],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = crate::registry::sha256_digest(&manifest_bytes);
        std::fs::write(
            blobs.join(manifest_digest.trim_start_matches("sha256:")),
            &manifest_bytes,
        )
        .unwrap();

        let index = serde_json::json!({"manifests": [{"digest": manifest_digest}]});
        std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();

        let ctlg_ref = ImageReference::parse(&format!("oci://{}", root.display())).unwrap();
        let (config_bytes, layers) = read_local_catalog(&ctlg_ref).unwrap();
        assert_eq!(configs_label(&config_bytes).unwrap(), "/configs");
        assert_eq!(layers.len(), 1);
    }
}
