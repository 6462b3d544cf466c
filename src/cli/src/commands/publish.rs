//! `airlift publish`: push an imageset archive into a mirror registry.

use std::path::PathBuf;

use clap::Args;

use airlift_core::Result;
use airlift_engine::publish::{self, PublishOptions};

#[derive(Args)]
pub struct PublishArgs {
    /// Directory holding the archive chunks
    #[arg(long)]
    pub from: PathBuf,

    /// Target mirror registry hostname[:port]
    #[arg(long = "to-mirror")]
    pub to_mirror: String,

    /// Directory the cluster manifests are written to
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Workspace directory
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Namespace prefix applied to every pushed repository
    #[arg(long)]
    pub user_namespace: Option<String>,

    /// Skip TLS verification against the mirror registry
    #[arg(long)]
    pub dest_skip_tls: bool,

    /// Keep per-run scratch space for debugging
    #[arg(long)]
    pub skip_cleanup: bool,

    /// Plan only; push nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Keep going when a non-release image fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Skip images missing from the archive
    #[arg(long)]
    pub skip_missing: bool,

    /// Skip the metadata sequence check (disaster recovery only)
    #[arg(long)]
    pub skip_metadata_check: bool,
}

pub async fn execute(args: PublishArgs) -> Result<()> {
    let opts = PublishOptions {
        archive_dir: args.from,
        mirror_registry: args.to_mirror,
        workspace: args.dir.unwrap_or_else(super::default_workspace),
        output_dir: args.output,
        user_namespace: args.user_namespace.unwrap_or_default(),
        dest_skip_tls: args.dest_skip_tls,
        skip_cleanup: args.skip_cleanup,
        dry_run: args.dry_run,
        skip_missing: args.skip_missing,
        continue_on_error: args.continue_on_error,
        skip_metadata_check: args.skip_metadata_check,
    };

    let report = publish::run(opts).await?;
    if report.errors > 0 {
        tracing::warn!(
            sequence = report.sequence,
            errors = report.errors,
            "publish completed with errors"
        );
    } else {
        tracing::info!(
            sequence = report.sequence,
            images = report.images,
            manifests = %report.manifests_dir.display(),
            "publish complete"
        );
    }
    Ok(())
}
