//! The `run` subcommand.

use clap::Args;

use crate::{
    pipeline::{BatchSummary, Pipeline},
    prelude::*,
    ui::Ui,
};

use super::PipelineOpts;

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    #[clap(flatten)]
    pub pipeline_opts: PipelineOpts,
}

/// Process every PDF currently in the input directory, once.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let pipeline = opts.pipeline_opts.build_pipeline().await?;
    let summary = run_once(&ui, &pipeline, opts.pipeline_opts.job_count).await?;
    summary.finish(&ui, opts.pipeline_opts.allowed_failure_rate)
}

/// Process whatever is in the input directory right now.
pub async fn run_once(ui: &Ui, pipeline: &Pipeline, job_count: usize) -> Result<BatchSummary> {
    let inputs = pipeline.layout().list_input_pdfs().await?;
    if inputs.is_empty() {
        debug!(input_dir = %pipeline.layout().input_dir.display(), "No PDFs to process");
        return Ok(BatchSummary::default());
    }
    info!(count = inputs.len(), "Processing résumés");
    Ok(pipeline.process_batch(ui, inputs, job_count).await)
}
