//! The `reparse` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    job::JobStatus,
    pipeline::persist::Persister,
    prelude::*,
    store::{FsJobStore, JobStore},
    ui::{ProgressConfig, Ui},
};

use super::LayoutOpts;

/// Reparse command line arguments.
#[derive(Debug, Args)]
pub struct ReparseOpts {
    #[clap(flatten)]
    pub layout_opts: LayoutOpts,

    /// Jobs to re-parse. Defaults to every job with a stored raw response.
    #[clap(value_name = "JOB_ID")]
    pub job_ids: Vec<String>,
}

/// Re-run parsing and validation from stored raw responses, without calling
/// OCR or the LLM.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_reparse(ui: Ui, opts: &ReparseOpts) -> Result<()> {
    let layout = opts.layout_opts.to_layout().await?;
    let store = Arc::new(FsJobStore::new(layout.clone()));
    let persister = Persister::new(layout, store.clone())?;

    let job_ids = if opts.job_ids.is_empty() {
        store
            .list()
            .await?
            .into_iter()
            .filter(|job| job.artifacts.raw_response.is_some())
            .map(|job| job.id)
            .collect::<Vec<_>>()
    } else {
        opts.job_ids.clone()
    };

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔁",
            msg: "Re-parsing responses",
            done_msg: "Re-parsed responses",
        },
        job_ids.len() as u64,
    );
    let (mut succeeded, mut failed, mut errors) = (0, 0, 0);
    for job_id in &job_ids {
        match persister.reparse(job_id).await {
            Ok(job) if job.status == JobStatus::Done => succeeded += 1,
            Ok(_) => failed += 1,
            Err(err) => {
                error!(job_id, "Cannot re-parse job: {:#}", err);
                errors += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_using_style();

    ui.display_message(
        "📊",
        &format!(
            "{} succeeded, {} failed validation, {} could not be re-parsed",
            succeeded, failed, errors
        ),
    );
    if errors > 0 {
        return Err(anyhow!("{} job(s) could not be re-parsed", errors));
    }
    Ok(())
}
