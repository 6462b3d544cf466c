//! Publish-phase supervisor.
//!
//! Unpacks the portable archive on the mirror side, enforces metadata
//! sequencing against the state stored in the target registry, replays
//! the recorded associations as pushes, rebuilds catalog images, builds
//! the graph-data image, emits cluster manifests, and finally persists
//! the advanced metadata. Metadata persistence is the last step: a run
//! that dies early leaves the stored sequence untouched so the same
//! archive publishes again from scratch.

use std::path::PathBuf;

use airlift_core::{
    AssociationSet, ImageKind, ImageReference, Metadata, MirrorError, Result, Transport,
};

use crate::batch::{BatchError, BatchWorker};
use crate::context::RunContext;
use crate::graphdata::{build_graph_image, GRAPH_ARCHIVE_PATH};
use crate::layout::FileLayout;
use crate::manifests::{write_catalog_sources, write_icsps, IcspGenerator};
use crate::mirror::{MirrorExecutor, MirrorOptions};
use crate::plan::{Mapping, MappingSet};
use crate::registry::RegistryClient;
use crate::rebuild::{discover_catalogs, CatalogRebuilder};
use crate::storage::{Backend, LocalBackend, RegistryBackend};
use crate::unarchive::Extractor;

/// Options for one publish run.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Directory holding the archive chunks (`--from`)
    pub archive_dir: PathBuf,
    /// Target mirror registry hostname[:port]
    pub mirror_registry: String,
    /// Workspace directory (`--dir`)
    pub workspace: PathBuf,
    /// Directory the cluster manifests are written to
    pub output_dir: PathBuf,
    /// Optional namespace prefix on the mirror
    pub user_namespace: String,
    pub dest_skip_tls: bool,
    pub skip_cleanup: bool,
    pub dry_run: bool,
    pub skip_missing: bool,
    pub continue_on_error: bool,
    /// Skip the sequence check, for disaster recovery only
    pub skip_metadata_check: bool,
}

/// Outcome of a completed publish run.
#[derive(Debug)]
pub struct PublishReport {
    pub sequence: u64,
    pub images: usize,
    pub manifests_dir: PathBuf,
    /// Safe failures that were logged but did not abort the run
    pub errors: usize,
}

pub async fn run(opts: PublishOptions) -> Result<PublishReport> {
    let ctx = RunContext::new(&opts.workspace, opts.skip_cleanup)?;
    let registry = RegistryClient::new(opts.dest_skip_tls);

    // Unpack the archive: working tree and image cache tree.
    let working_dir = ctx.scratch_dir().join("working-dir");
    let cache_dir = ctx.scratch_dir().join("cache");
    let report = Extractor::new(&opts.archive_dir, &working_dir, &cache_dir).extract()?;
    tracing::info!(
        chunks = report.chunks,
        unpacked = report.unpacked,
        "unarchived imageset"
    );

    // Incoming metadata travels inside the archive.
    let incoming_backend = LocalBackend::new(&working_dir)?;
    let incoming = incoming_backend.read_metadata().await?;
    let sequence = incoming.latest_sequence();

    // Sequence enforcement against the registry-stored state.
    let stored_backend = metadata_backend(&opts, &incoming)?;
    if let Some(backend) = &stored_backend {
        match backend.read_metadata().await {
            Ok(stored) => {
                if !opts.skip_metadata_check {
                    stored.check_incoming(&incoming)?;
                }
            }
            Err(MirrorError::MetadataNotFound(_)) => {
                tracing::info!("no existing metadata found, setting up new workspace");
                if !opts.skip_metadata_check && sequence != 1 {
                    return Err(MirrorError::Sequence {
                        expected: 1,
                        got: sequence,
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }

    // Replay associations as pushes.
    let run_record = incoming.latest().ok_or_else(|| {
        MirrorError::InvalidComponent("incoming metadata has no recorded runs".to_string())
    })?;
    let associations = AssociationSet::from_flattened(run_record.associations.clone())?;
    let layout = FileLayout::new(cache_dir.join("docker"))?;
    fetch_missing_blobs(&registry, &layout, &associations, &incoming, &opts).await?;

    let mappings = mappings_from_associations(&associations, &opts)?;
    let executor = MirrorExecutor::new(
        &registry,
        &layout,
        MirrorOptions {
            skip_missing: opts.skip_missing,
            continue_on_error: opts.continue_on_error,
            dry_run: opts.dry_run,
            ..Default::default()
        },
        ctx.cancel_token(),
    );
    let worker = BatchWorker::new(&executor, ctx.logs_dir());
    let planned: Vec<Mapping> = mappings.iter().cloned().collect();

    let mut safe_errors = 0;
    let mut pushed = MappingSet::new();
    match worker.run(&planned).await {
        Ok(summary) => {
            for (mapping, result) in summary.results {
                let mut done = mapping;
                if let Some(digest) = result.manifest_digest {
                    done.destination = done.destination.pinned_to(&digest);
                }
                pushed.add(done);
            }
        }
        Err(BatchError::Safe(e)) => {
            tracing::warn!(count = e.count, log = %e.log.display(), "publish completed with errors");
            safe_errors = e.count;
        }
        Err(BatchError::Unsafe(e)) => return Err(e.source),
        Err(BatchError::Io(e)) => return Err(e.into()),
    }

    // Catalog rebuilds; a failed catalog never stops the others.
    let catalogs = discover_catalogs(&working_dir, &opts.mirror_registry)?;
    if !catalogs.is_empty() && !opts.dry_run {
        let rebuilder = CatalogRebuilder::new(&registry, ctx.scratch_dir().join("rebuild"));
        let (catalog_mappings, build_errs) = rebuilder.rebuild_all(&catalogs).await;
        if let Some(err) = build_errs {
            tracing::error!(error = %err, "catalog rebuilds incomplete");
            safe_errors += err.leaves().len();
        }
        pushed.merge(catalog_mappings);
    }

    // Graph-data image, when the archive staged one.
    if working_dir.join(GRAPH_ARCHIVE_PATH).is_file() && !opts.dry_run {
        match build_graph_image(
            &registry,
            &working_dir,
            &opts.mirror_registry,
            &opts.user_namespace,
        )
        .await
        {
            Ok(mapping) => {
                pushed.add(mapping);
            }
            Err(e) => {
                tracing::error!(error = %e, "graph-data image build failed");
                safe_errors += 1;
            }
        }
    }

    // Cluster manifests.
    let manifests_dir = opts.output_dir.join("results");
    write_manifest_documents(&manifests_dir, &pushed)?;

    // Persistence is the barrier: only after everything above succeeded
    // does the stored sequence advance.
    if let Some(backend) = &stored_backend {
        if !opts.dry_run {
            backend.write_metadata(&incoming).await?;
        }
    }

    tracing::info!(sequence, images = pushed.len(), "imageset published");
    Ok(PublishReport {
        sequence,
        images: pushed.len(),
        manifests_dir,
        errors: safe_errors,
    })
}

// Single-use metadata runs stateless: no registry-stored sequence state.
fn metadata_backend(
    opts: &PublishOptions,
    incoming: &Metadata,
) -> Result<Option<RegistryBackend>> {
    if incoming.single_use {
        tracing::warn!("metadata has single-use label, using stateless mode");
        return Ok(None);
    }
    let url = RegistryBackend::metadata_image_url(
        &opts.mirror_registry,
        &opts.user_namespace,
        &incoming.uid,
    );
    let backend = RegistryBackend::new(
        &url,
        opts.dest_skip_tls,
        opts.workspace.join("publish-state"),
    )?;
    Ok(Some(backend))
}

// Turn recorded associations into file->registry mappings.
fn mappings_from_associations(
    associations: &AssociationSet,
    opts: &PublishOptions,
) -> Result<MappingSet> {
    let mut mappings = MappingSet::new();
    for image in associations.keys() {
        let Some(assocs) = associations.search(image) else {
            continue;
        };
        for assoc in assocs {
            // Child manifests ride along with their parent push.
            if assoc.name != image {
                continue;
            }
            let rel = assoc.path.trim_start_matches("v2/");
            let mut source = ImageReference::parse(&format!("file://{rel}"))?;
            source.digest = Some(assoc.id.clone());
            source.tag = assoc.tag_symlink.clone();

            let dest_namespace = if opts.user_namespace.is_empty() {
                source.namespace.clone()
            } else if source.namespace.is_empty() {
                opts.user_namespace.clone()
            } else {
                format!("{}/{}", opts.user_namespace, source.namespace)
            };
            let destination = ImageReference {
                transport: Transport::Docker,
                registry: opts.mirror_registry.clone(),
                namespace: dest_namespace,
                name: source.name.clone(),
                tag: source.tag.clone(),
                digest: source.digest.clone(),
                layout_path: None,
            };
            mappings.add(Mapping::new(source, destination, assoc.kind));
        }
    }
    Ok(mappings)
}

// Layers referenced by associations but absent from the archive were
// mirrored by an earlier run; fetch them from the mirror itself into the
// layout so the push side finds them.
async fn fetch_missing_blobs(
    registry: &RegistryClient,
    layout: &FileLayout,
    associations: &AssociationSet,
    incoming: &Metadata,
    opts: &PublishOptions,
) -> Result<()> {
    let mut errs = Vec::new();
    for image in associations.keys() {
        let Some(assocs) = associations.search(image) else {
            continue;
        };
        for assoc in assocs {
            for digest in &assoc.layer_digests {
                if layout.has_blob(&assoc.path, digest) {
                    continue;
                }
                let Some(repo) = incoming.find_blob_repository(digest) else {
                    errs.push(MirrorError::InvalidComponent(format!(
                        "layer {digest} is not present in the archive or previous metadata"
                    )));
                    continue;
                };
                let source = ImageReference::parse(&format!(
                    "{}/{}",
                    opts.mirror_registry,
                    if opts.user_namespace.is_empty() {
                        repo.to_string()
                    } else {
                        format!("{}/{repo}", opts.user_namespace)
                    }
                ))?;
                tracing::debug!(layer = %digest, from = %source, "fetching blob from prior run");
                let data = registry.pull_blob(&source, digest).await?;
                layout.write_blob(&assoc.path, digest, &data)?;
            }
        }
    }
    match MirrorError::aggregate(errs) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn write_manifest_documents(dir: &std::path::Path, pushed: &MappingSet) -> Result<()> {
    let mut all_icsps = Vec::new();

    let generic: MappingSet = pushed
        .iter()
        .filter(|m| m.kind == ImageKind::Generic)
        .cloned()
        .collect();
    all_icsps.extend(IcspGenerator::new("generic").generate(&generic)?);

    let release: MappingSet = pushed
        .iter()
        .filter(|m| m.kind.is_release() || m.kind == ImageKind::GraphData)
        .cloned()
        .collect();
    all_icsps.extend(IcspGenerator::new("release").generate(&release)?);

    let operator: MappingSet = pushed
        .iter()
        .filter(|m| {
            matches!(
                m.kind,
                ImageKind::OperatorCatalog | ImageKind::OperatorBundle | ImageKind::OperatorRelated
            )
        })
        .cloned()
        .collect();
    let mut generator = IcspGenerator::new("operator");
    generator.catalog_labels = true;
    all_icsps.extend(generator.generate(&operator)?);

    write_icsps(dir, &all_icsps)?;
    write_catalog_sources(dir, pushed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::ImageAssociation;

    fn opts() -> PublishOptions {
        PublishOptions {
            archive_dir: PathBuf::from("/nonexistent"),
            mirror_registry: "registry.local:5000".to_string(),
            workspace: PathBuf::from("/nonexistent"),
            output_dir: PathBuf::from("/nonexistent"),
            user_namespace: String::new(),
            dest_skip_tls: false,
            skip_cleanup: false,
            dry_run: false,
            skip_missing: false,
            continue_on_error: false,
            skip_metadata_check: false,
        }
    }

    fn assoc_set() -> AssociationSet {
        let mut set = AssociationSet::new();
        set.add(
            "quay.io/example/foo:v1",
            ImageAssociation {
                name: "quay.io/example/foo:v1".to_string(),
                path: "v2/example/foo".to_string(),
                id: "sha256:top".to_string(),
                manifest_digests: vec![],
                layer_digests: vec![],
                tag_symlink: Some("v1".to_string()),
                kind: ImageKind::Generic,
            },
        );
        set
    }

    #[test]
    fn test_mappings_from_associations() {
        let mappings = mappings_from_associations(&assoc_set(), &opts()).unwrap();
        assert_eq!(mappings.len(), 1);
        let m = mappings.iter().next().unwrap();
        assert_eq!(m.source.transport, Transport::File);
        assert_eq!(m.source.repository(), "example/foo");
        assert_eq!(m.destination.transport, Transport::Docker);
        assert_eq!(m.destination.registry, "registry.local:5000");
        assert_eq!(m.destination.repository(), "example/foo");
        assert_eq!(m.destination.tag.as_deref(), Some("v1"));
        assert_eq!(m.destination.digest.as_deref(), Some("sha256:top"));
    }

    #[test]
    fn test_mappings_respect_user_namespace() {
        let mut o = opts();
        o.user_namespace = "team".to_string();
        let mappings = mappings_from_associations(&assoc_set(), &o).unwrap();
        let m = mappings.iter().next().unwrap();
        assert_eq!(m.destination.repository(), "team/example/foo");
    }

    #[test]
    fn test_mappings_skip_child_manifest_entries() {
        let mut set = assoc_set();
        set.add(
            "quay.io/example/foo:v1",
            ImageAssociation {
                name: "sha256:child".to_string(),
                path: "v2/example/foo".to_string(),
                id: "sha256:child".to_string(),
                manifest_digests: vec![],
                layer_digests: vec![],
                tag_symlink: None,
                kind: ImageKind::Generic,
            },
        );
        let mappings = mappings_from_associations(&set, &opts()).unwrap();
        assert_eq!(mappings.len(), 1);
    }
}
