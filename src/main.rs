use clap::{Parser, Subcommand};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cpu_limit;
mod error;
mod extract;
mod job;
mod layout;
mod logging;
mod ocr;
mod pipeline;
mod prelude;
mod prompt;
mod rasterize;
mod rate_limit;
mod resume;
mod retry;
mod store;
mod ui;
mod validate;

/// Turn a directory of PDF résumés into structured JSON.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL. Defaults to
    https://openrouter.ai/api/v1.
  - OPENAI_API_KEY: The API key to use.
  - OPENROUTER_API_KEY: Used if OPENAI_API_KEY is not set.
  - RESUME_INGEST_MODEL (optional): The model to use.
  - RUST_LOG (optional): Log filter, such as "debug" or
    "resume_ingest=trace". Defaults to "info".

  PDF conversion needs poppler (`pdfinfo`, `pdftocairo`) and OCR needs
  `tesseract` on your PATH.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// Directory for daily log files.
    #[clap(long, global = true, env = "RESUME_INGEST_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Don't write log files.
    #[clap(long, global = true)]
    no_log_file: bool,

    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Process every PDF in the input directory once.
    Run(cmd::run::RunOpts),
    /// Keep processing PDFs as they appear in the input directory.
    Watch(cmd::watch::WatchOpts),
    /// Re-parse and re-validate stored LLM responses, without calling OCR or
    /// the LLM.
    Reparse(cmd::reparse::ReparseOpts),
    /// Print job records as JSON Lines.
    Status(cmd::status::StatusOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) | Cmd::Watch(_) | Cmd::Reparse(_) => false,
            Cmd::Status(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }

    /// Does this command do enough work to be worth a log file?
    fn wants_log_file(&self) -> bool {
        matches!(self, Cmd::Run(_) | Cmd::Watch(_) | Cmd::Reparse(_))
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists, so they can
    // feed `env` defaults below.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    let ui = Ui::init();

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    let log_dir = (opts.subcmd.wants_log_file() && !opts.no_log_file)
        .then_some(opts.log_dir.as_path());
    let _log_guard = logging::init_tracing(&ui, log_dir)?;

    // Call our real `main` function now that logging is set up.
    real_main(ui, opts).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<()> {
    debug!("Parsed options: {:?}", opts);
    match &opts.subcmd {
        Cmd::Run(run_opts) => cmd::run::cmd_run(ui, run_opts).await,
        Cmd::Watch(watch_opts) => cmd::watch::cmd_watch(ui, watch_opts).await,
        Cmd::Reparse(reparse_opts) => cmd::reparse::cmd_reparse(ui, reparse_opts).await,
        Cmd::Status(status_opts) => cmd::status::cmd_status(status_opts).await,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await,
    }
}
