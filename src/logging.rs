//! Tracing setup.
//!
//! Logs go to stderr (without trampling our progress bars) and, when a log
//! directory is configured, to a daily rolling file named
//! `resume-ingest.log.YYYY-MM-DD`. The file never gets ANSI colors.

use std::str::FromStr as _;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

use crate::{prelude::*, ui::Ui};

/// Base name of our log files. `tracing-appender` adds the date.
pub const LOG_FILE_NAME: &str = "resume-ingest.log";

/// Install our global subscriber.
///
/// Keep the returned guard alive until exit, or buffered file output may be
/// lost.
pub fn init_tracing(ui: &Ui, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let directive = Directive::from_str("info").context("bad default log directive")?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer());

    let (file_layer, guard) = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("cannot create log directory {:?}", log_dir))?;
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("cannot install tracing subscriber")?;
    Ok(guard)
}
