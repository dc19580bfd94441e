//! The `watch` subcommand.

use std::{pin::pin, time::Duration};

use clap::Args;
use tokio::time::Interval;

use crate::{pipeline::BatchSummary, prelude::*, ui::Ui};

use super::{PipelineOpts, run::run_once};

/// Watch command line arguments.
#[derive(Debug, Args)]
pub struct WatchOpts {
    #[clap(flatten)]
    pub pipeline_opts: PipelineOpts,

    /// How often to check the input directory, in seconds.
    #[clap(long, default_value_t = 5)]
    pub interval: u64,
}

/// Poll the input directory until interrupted.
///
/// A batch that is already running is allowed to finish, so no job is left
/// half-done by Ctrl-C.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_watch(ui: Ui, opts: &WatchOpts) -> Result<()> {
    let pipeline = opts.pipeline_opts.build_pipeline().await?;
    let job_count = opts.pipeline_opts.job_count;
    let mut interval = tokio::time::interval(Duration::from_secs(opts.interval.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        input_dir = %pipeline.layout().input_dir.display(),
        interval = opts.interval,
        "Watching for résumés; press Ctrl-C to stop"
    );

    let (ui_ref, pipeline_ref) = (&ui, &pipeline);
    let totals = watch_loop(&ui, tokio::signal::ctrl_c(), interval, move || {
        run_once(ui_ref, pipeline_ref, job_count)
    })
    .await?;
    totals.finish(&ui, opts.pipeline_opts.allowed_failure_rate)
}

/// Run `batch` on every tick of `interval` until `stop` completes, and
/// return the combined counts.
///
/// `stop` is polled first, so a stop request that arrives during a long batch
/// wins over the tick that has come due in the meantime.
async fn watch_loop<Stop, Batch, Fut>(
    ui: &Ui,
    stop: Stop,
    mut interval: Interval,
    mut batch: Batch,
) -> Result<BatchSummary>
where
    Stop: Future,
    Batch: FnMut() -> Fut,
    Fut: Future<Output = Result<BatchSummary>>,
{
    // Created once, so a Ctrl-C during a batch is seen as soon as it ends.
    let mut stop = pin!(stop);
    let mut totals = BatchSummary::default();
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                info!("Interrupted; stopping");
                break;
            }
            _ = interval.tick() => {
                let summary = batch().await?;
                if summary.processed() + summary.duplicates > 0 {
                    summary.finish(ui, 1.0)?;
                }
                totals.merge(summary);
            }
        }
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    fn one_success() -> BatchSummary {
        BatchSummary {
            succeeded: 1,
            ..BatchSummary::default()
        }
    }

    #[tokio::test]
    async fn a_pending_stop_wins_over_a_due_tick() -> Result<()> {
        let calls = AtomicUsize::new(0);
        // The first tick of an interval is due immediately.
        let interval = tokio::time::interval(Duration::from_millis(1));
        let totals = watch_loop(
            &Ui::init_for_tests(),
            std::future::ready(()),
            interval,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(one_success()))
            },
        )
        .await?;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(totals.processed(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn a_stop_during_a_batch_starts_no_further_batches() -> Result<()> {
        let calls = AtomicUsize::new(0);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut stop_tx = Some(stop_tx);
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let totals = watch_loop(
            &Ui::init_for_tests(),
            async move {
                stop_rx.await.ok();
            },
            interval,
            || {
                // Ask to stop during the second batch, which outlasts the
                // interval so the next tick is already due when it ends.
                if calls.fetch_add(1, Ordering::SeqCst) == 1
                    && let Some(tx) = stop_tx.take()
                {
                    let _ = tx.send(());
                }
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(one_success())
                }
            },
        )
        .await?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(totals.succeeded, 2);
        Ok(())
    }

    #[tokio::test]
    async fn batch_errors_stop_the_loop() {
        let interval = tokio::time::interval(Duration::from_millis(1));
        let result = watch_loop(
            &Ui::init_for_tests(),
            std::future::pending::<()>(),
            interval,
            || async { Err::<BatchSummary, _>(anyhow!("input directory is gone")) },
        )
        .await;
        assert!(result.is_err());
    }
}
