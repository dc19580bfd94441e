//! The `status` subcommand.

use clap::Args;

use crate::{
    async_utils::io::write_jsonl,
    job::JobStatus,
    prelude::*,
    store::{FsJobStore, JobStore as _},
};

use super::LayoutOpts;

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    #[clap(flatten)]
    pub layout_opts: LayoutOpts,

    /// Only show failed jobs.
    #[clap(long)]
    pub failed: bool,

    /// Write JSON Lines here instead of standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// Print job records as JSON Lines.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let layout = opts.layout_opts.to_layout().await?;
    let jobs = FsJobStore::new(layout)
        .list()
        .await?
        .into_iter()
        .filter(|job| !opts.failed || job.status == JobStatus::Failed)
        .collect::<Vec<_>>();
    write_jsonl(opts.output_path.as_deref(), &jobs).await
}
