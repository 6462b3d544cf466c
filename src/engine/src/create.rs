//! Create-phase supervisor.
//!
//! Resolves the declared imageset against the upstream world: plans
//! releases, catalogs, additional images and graph data, copies every
//! planned image into the workspace file layout, records associations
//! and the next sequence number, persists metadata, and packages the
//! workspace into the portable archive.

use std::path::PathBuf;

use airlift_core::validate;
use airlift_core::{
    AssociationSet, ImageKind, ImageSetConfiguration, Metadata, MirrorError, PastBlob,
    PastManifest, PastMirror, Result,
};

use crate::additional::plan_additional;
use crate::archive::Packager;
use crate::associate::associate_image_layers;
use crate::batch::{BatchError, BatchWorker};
use crate::cincinnati::{CincinnatiClient, GraphClient, DEFAULT_GRAPH_URL};
use crate::context::RunContext;
use crate::graphdata::stage_graph_data;
use crate::layout::FileLayout;
use crate::mirror::{MirrorExecutor, MirrorOptions};
use crate::operator::CatalogPlanner;
use crate::plan::MappingSet;
use crate::registry::RegistryClient;
use crate::release::{expand_release_content, ReleasePlanner};
use crate::storage;
use crate::unarchive::{CACHE_PREFIX, WORKING_DIR_PREFIX};

/// Options for one create run.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Workspace directory holding state across runs
    pub workspace: PathBuf,
    /// Directory the archive chunks are written to
    pub output_dir: PathBuf,
    pub skip_image_pin: bool,
    pub skip_cleanup: bool,
    pub source_skip_tls: bool,
    pub dest_skip_tls: bool,
    pub dry_run: bool,
    pub skip_missing: bool,
    pub continue_on_error: bool,
}

/// Outcome of a completed create run.
#[derive(Debug)]
pub struct CreateReport {
    pub sequence: u64,
    pub images: usize,
    pub archives: Vec<PathBuf>,
}

/// Run the create phase with the default Cincinnati endpoint.
pub async fn run(cfg: ImageSetConfiguration, opts: CreateOptions) -> Result<CreateReport> {
    let graph = CincinnatiClient::new(DEFAULT_GRAPH_URL)?;
    run_with_graph(cfg, opts, &graph).await
}

/// Run the create phase against an injected graph client.
pub async fn run_with_graph(
    cfg: ImageSetConfiguration,
    opts: CreateOptions,
    graph: &dyn GraphClient,
) -> Result<CreateReport> {
    validate::validate(&cfg)?;

    let ctx = RunContext::new(&opts.workspace, opts.skip_cleanup)?;
    let layout = FileLayout::new(ctx.src_dir())?;
    let registry = RegistryClient::new(opts.source_skip_tls);

    let backend = storage::from_config(&cfg.storage_config, ctx.workspace(), opts.dest_skip_tls).await?;
    let mut metadata = match backend.read_metadata().await {
        Ok(meta) => meta,
        Err(MirrorError::MetadataNotFound(path)) => {
            tracing::info!(path = %path, "no existing metadata, starting a new workspace");
            Metadata::new()
        }
        Err(e) => return Err(e),
    };

    // Planning: releases, catalogs, additional images.
    let mut mappings = MappingSet::new();
    let cancel = ctx.cancel_token();

    mappings.merge(ReleasePlanner::new(graph).plan(&cfg, &cancel).await?);

    let planner = CatalogPlanner::new(
        &registry,
        ctx.src_dir(),
        ctx.scratch_dir(),
        opts.skip_image_pin,
    )
    .with_layer_cache(ctx.layer_cache());
    let catalog_plan = planner.plan(&cfg, &metadata, &cancel).await?;
    mappings.merge(catalog_plan.mappings);

    mappings.merge(plan_additional(&cfg)?);

    if cfg.mirror.platform.graph && !opts.dry_run {
        stage_graph_data(&ctx.src_dir()).await?;
    }

    // Execute: everything lands in the file layout. Payload expansion
    // runs between the two passes since it reads pulled payload layers.
    let executor = MirrorExecutor::new(
        &registry,
        &layout,
        MirrorOptions {
            blocked: cfg.mirror.blocked_images.iter().map(|b| b.name.clone()).collect(),
            skip_missing: opts.skip_missing,
            continue_on_error: opts.continue_on_error,
            dry_run: opts.dry_run,
            ..Default::default()
        },
        cancel.clone(),
    );
    let worker = BatchWorker::new(&executor, ctx.logs_dir());

    let planned: Vec<_> = mappings.iter().cloned().collect();
    run_batch(&worker, &planned).await?;

    let mut content = MappingSet::new();
    if !opts.dry_run {
        for payload in mappings.of_kind(ImageKind::ReleasePayload) {
            content.merge(expand_release_content(&layout, &payload.source)?);
        }
        let expanded: Vec<_> = content.iter().cloned().collect();
        if !expanded.is_empty() {
            run_batch(&worker, &expanded).await?;
        }
    }
    mappings.merge(content);

    if opts.dry_run {
        tracing::info!(images = mappings.len(), "dry run complete, nothing transferred");
        return Ok(CreateReport {
            sequence: metadata.latest_sequence(),
            images: mappings.len(),
            archives: Vec::new(),
        });
    }

    // Associate, then record the run.
    let all_mappings: Vec<_> = mappings.iter().cloned().collect();
    let (associations, soft_errs) = associate_image_layers(&layout, &all_mappings);
    if let Some(err) = soft_errs {
        tracing::warn!(error = %err, "incomplete image associations");
    }
    associations.validate(layout.root(), &metadata.past_blob_digests())?;

    let run_record = build_past_mirror(&layout, &metadata, &associations, catalog_plan.provenance)?;
    let sequence = run_record.sequence;
    metadata.record(run_record)?;

    if metadata.single_use {
        tracing::warn!("metadata has single-use label, skipping persistence");
    } else {
        backend.write_metadata(&metadata).await?;
    }

    // Package the workspace. The configuration rides along at the top
    // level; the unarchiver ignores it.
    let config_dir = ctx.scratch_dir().join("config");
    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(
        config_dir.join("imageset-config.yaml"),
        serde_yaml::to_string(&cfg)?,
    )?;

    let segment = cfg.archive_size.map(|gib| gib * 1024 * 1024 * 1024);
    let packager = Packager::new(&opts.output_dir, segment)?;
    let src = ctx.src_dir();
    let archives = packager.pack(&[
        (config_dir, String::new()),
        (
            ctx.workspace().join("publish"),
            format!("{WORKING_DIR_PREFIX}/publish"),
        ),
        (
            src.join("catalogs"),
            format!("{WORKING_DIR_PREFIX}/catalogs"),
        ),
        (src.join("charts"), format!("{WORKING_DIR_PREFIX}/charts")),
        (
            src.join("graph-data"),
            format!("{WORKING_DIR_PREFIX}/graph-data"),
        ),
        (
            src.join("release-signatures"),
            format!("{WORKING_DIR_PREFIX}/release-signatures"),
        ),
        (src.join("v2"), CACHE_PREFIX.to_string()),
    ])?;

    tracing::info!(sequence, chunks = archives.len(), "imageset created");
    Ok(CreateReport {
        sequence,
        images: mappings.len(),
        archives,
    })
}

async fn run_batch(
    worker: &BatchWorker<'_, '_>,
    mappings: &[crate::plan::Mapping],
) -> Result<()> {
    match worker.run(mappings).await {
        Ok(_) => Ok(()),
        // Safe failures were logged and counted; the create still
        // produces a usable imageset from what succeeded.
        Err(BatchError::Safe(e)) => {
            tracing::warn!(count = e.count, log = %e.log.display(), "some images failed to mirror");
            Ok(())
        }
        Err(BatchError::Unsafe(e)) => Err(e.source),
        Err(BatchError::Io(e)) => Err(e.into()),
    }
}

// Fold the run into a PastMirror: associations, newly seen blobs and
// manifests relative to prior runs.
fn build_past_mirror(
    layout: &FileLayout,
    metadata: &Metadata,
    associations: &AssociationSet,
    operators: Vec<airlift_core::CatalogProvenance>,
) -> Result<PastMirror> {
    let past_blobs = metadata.past_blob_digests();
    let past_manifests = metadata.past_manifest_paths();

    let mut blobs = Vec::new();
    for (image_path, digest) in layout.list_blobs()? {
        if !past_blobs.contains(&digest) {
            blobs.push(PastBlob {
                digest,
                repository: image_path.trim_start_matches("v2/").to_string(),
            });
        }
    }

    let mut manifests = Vec::new();
    for path in layout.list_manifests()? {
        if !past_manifests.contains(&path) {
            manifests.push(PastManifest { path });
        }
    }

    Ok(PastMirror {
        sequence: metadata.latest_sequence() + 1,
        timestamp: chrono::Utc::now(),
        associations: associations.flatten(),
        blobs,
        manifests,
        operators,
    })
}
