//! `airlift create`: build a portable imageset archive.

use std::path::PathBuf;

use clap::Args;

use airlift_core::{ImageSetConfiguration, MirrorError, Result};
use airlift_engine::create::{self, CreateOptions};

#[derive(Args)]
pub struct CreateArgs {
    /// Imageset configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Directory the archive chunks are written to
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Workspace directory holding state across runs
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Do not resolve catalog image tags to digests
    #[arg(long)]
    pub skip_image_pin: bool,

    /// Keep per-run scratch space for debugging
    #[arg(long)]
    pub skip_cleanup: bool,

    /// Skip TLS verification against source registries
    #[arg(long)]
    pub skip_tls: bool,

    /// Skip TLS verification against the metadata storage registry
    #[arg(long)]
    pub dest_skip_tls: bool,

    /// Plan only; transfer nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Keep going when a non-release image fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Skip sources whose manifests no longer exist
    #[arg(long)]
    pub skip_missing: bool,
}

pub async fn execute(args: CreateArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.config).map_err(|e| {
        MirrorError::Config(format!("reading {}: {e}", args.config.display()))
    })?;
    let cfg = ImageSetConfiguration::from_yaml(&text)?;

    let opts = CreateOptions {
        workspace: args.dir.unwrap_or_else(super::default_workspace),
        output_dir: args.output,
        skip_image_pin: args.skip_image_pin,
        skip_cleanup: args.skip_cleanup,
        source_skip_tls: args.skip_tls,
        dest_skip_tls: args.dest_skip_tls,
        dry_run: args.dry_run,
        skip_missing: args.skip_missing,
        continue_on_error: args.continue_on_error,
    };

    let report = create::run(cfg, opts).await?;
    tracing::info!(
        sequence = report.sequence,
        images = report.images,
        chunks = report.archives.len(),
        "create complete"
    );
    Ok(())
}
