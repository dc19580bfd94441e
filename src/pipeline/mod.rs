//! The per-résumé pipeline: intake → rasterize → OCR → extract → validate →
//! archive.
//!
//! Each job runs its stages strictly in order, writing one artifact per stage
//! into its own directory and saving its record after every step. A failed
//! stage is recorded on the job and stops it; nothing is retried here. Jobs
//! share nothing but the filesystem, so a batch can run several at once.

use std::{pin::pin, sync::Arc};

use futures::StreamExt as _;

use crate::{
    async_utils::io::{move_file, write_atomic, write_json_atomic},
    error::StageError,
    extract::{FieldExtractor, TokenUsage},
    job::{
        JobStage, JobStatus, ResumeJob, file_sha256, file_timestamp, job_id_for,
        job_id_for_contents,
    },
    layout::{ArchiveKind, Layout},
    ocr::{OcrEngine, ocr_document},
    prelude::*,
    rasterize::Rasterizer,
    store::JobStore,
    ui::{ProgressConfig, Ui},
};

use self::persist::Persister;

pub mod persist;

/// What happened to an input file.
#[derive(Clone, Debug)]
pub enum ProcessOutcome {
    /// We ran the pipeline. The job may have succeeded or failed.
    Processed(ResumeJob),

    /// A file with the same name and contents had already been processed
    /// successfully, so we archived it as a duplicate without touching its
    /// outputs.
    Duplicate(ResumeJob),
}

/// The stage implementations, plus where to put things.
pub struct Pipeline {
    layout: Layout,
    store: Arc<dyn JobStore>,
    rasterizer: Arc<dyn Rasterizer>,
    ocr_engine: Arc<dyn OcrEngine>,
    ocr_page_concurrency: usize,
    extractor: Arc<dyn FieldExtractor>,
    persister: Persister,
}

impl Pipeline {
    pub fn new(
        layout: Layout,
        store: Arc<dyn JobStore>,
        rasterizer: Arc<dyn Rasterizer>,
        ocr_engine: Arc<dyn OcrEngine>,
        ocr_page_concurrency: usize,
        extractor: Arc<dyn FieldExtractor>,
    ) -> Result<Self> {
        Ok(Self {
            persister: Persister::new(layout.clone(), store.clone())?,
            layout,
            store,
            rasterizer,
            ocr_engine,
            ocr_page_concurrency,
            extractor,
        })
    }

    /// Our directory layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Process a batch of input files, up to `job_count` at a time.
    ///
    /// Infrastructure errors for one file (such as being unable to write its
    /// job record) are logged and counted as failures; they don't stop the
    /// batch.
    pub async fn process_batch(
        &self,
        ui: &Ui,
        inputs: Vec<PathBuf>,
        job_count: usize,
    ) -> BatchSummary {
        let pb = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: "Processing résumés",
                done_msg: "Processed résumés",
            },
            inputs.len() as u64,
        );
        let outcomes = futures::stream::iter(inputs)
            .map(|input| async move {
                let outcome = self.process(&input).await;
                (input, outcome)
            })
            .buffer_unordered(job_count.max(1));
        let mut outcomes = pin!(pb.wrap_stream(outcomes));

        let mut summary = BatchSummary::default();
        while let Some((input, outcome)) = outcomes.next().await {
            match outcome {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    error!(input = %input.display(), "Cannot process file: {:#}", err);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Run one input file through the pipeline.
    ///
    /// Returns `Err` only when we can't even keep the job's books (for
    /// example, the job record can't be written). Stage failures are recorded
    /// on the returned job instead.
    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    pub async fn process(&self, input: &Path) -> Result<ProcessOutcome> {
        let file_name = input
            .file_name()
            .ok_or_else(|| anyhow!("{:?} has no file name", input))?
            .to_string_lossy()
            .into_owned();
        let content_sha256 = file_sha256(input).await?;
        let mut job_id = job_id_for(&file_name);

        let mut existing = self.store.get(&job_id).await?;
        if let Some(previous) = existing.as_ref()
            && previous.content_sha256.as_deref() != Some(content_sha256.as_str())
            && self.is_published(previous).await
        {
            // A different résumé under a name we've already published.
            job_id = job_id_for_contents(&file_name, &content_sha256);
            info!(
                job_id,
                previous_job_id = %previous.id,
                "New contents under a published file name; using a separate job"
            );
            existing = self.store.get(&job_id).await?;
        }
        if let Some(existing) = existing.as_ref()
            && self.is_published(existing).await
        {
            return self.archive_duplicate(existing.clone(), input).await;
        }
        let mut job = match existing {
            Some(mut existing) => {
                info!(
                    job_id,
                    attempt = existing.attempts + 1,
                    previous_status = %existing.status,
                    "Re-running job"
                );
                existing.restart(input, content_sha256);
                self.store.update(&existing).await?;
                existing
            }
            None => {
                let mut job = ResumeJob::new(input)?;
                job.id = job_id;
                job.content_sha256 = Some(content_sha256);
                self.store.create(&job).await?;
                job
            }
        };

        match self.run_stages(&mut job).await {
            Ok(()) => {
                info!(job_id = %job.id, "Job done");
                self.store.update(&job).await?;
            }
            Err(err) => self.persister.record_failure(&mut job, err).await?,
        }
        Ok(ProcessOutcome::Processed(job))
    }

    /// Is this job done, with its output still in place?
    async fn is_published(&self, job: &ResumeJob) -> bool {
        job.status == JobStatus::Done
            && tokio::fs::try_exists(self.layout.output(&job.id))
                .await
                .unwrap_or(false)
    }

    /// Set aside an input we've already processed.
    async fn archive_duplicate(&self, job: ResumeJob, input: &Path) -> Result<ProcessOutcome> {
        let dest = self
            .layout
            .archived_source(ArchiveKind::Duplicates, &job.id, &file_timestamp());
        move_file(input, &dest)
            .await
            .with_context(|| format!("failed to archive duplicate {:?}", input))?;
        warn!(
            job_id = %job.id,
            archived = %dest.display(),
            "Already processed; archived duplicate input"
        );
        Ok(ProcessOutcome::Duplicate(job))
    }

    /// Run every stage in order, stopping at the first failure.
    async fn run_stages(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.intake(job).await?;
        self.rasterize(job).await?;
        self.ocr(job).await?;
        self.extract(job).await?;
        self.persister.validate(job).await?;
        self.persister.archive(job).await
    }

    /// Move the input into the job's directory.
    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    async fn intake(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.persister
            .enter(job, JobStage::Intake, StageError::Intake)
            .await?;
        let dest = self.layout.source_copy(&job.id);
        move_file(&job.source_path, &dest)
            .await
            .map_err(StageError::Intake)?;
        job.artifacts.source = Some(dest);
        self.store.update(job).await.map_err(StageError::Intake)
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    async fn rasterize(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.persister
            .enter(job, JobStage::Rasterize, StageError::Conversion)
            .await?;
        let source = required_artifact(&job.artifacts.source, "source copy")
            .map_err(StageError::Conversion)?;
        let rasterized = self
            .rasterizer
            .rasterize(&source, &self.layout.pages_dir(&job.id))
            .await
            .map_err(StageError::Conversion)?;
        job.page_count = Some(rasterized.total_pages);
        job.artifacts.pages = rasterized.pages;
        self.store.update(job).await.map_err(StageError::Conversion)
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    async fn ocr(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.persister
            .enter(job, JobStage::Ocr, StageError::Ocr)
            .await?;
        let text = ocr_document(
            self.ocr_engine.clone(),
            &job.id,
            &job.artifacts.pages,
            self.ocr_page_concurrency,
        )
        .await
        .map_err(StageError::Ocr)?;
        let text_path = self.layout.text(&job.id);
        write_atomic(&text_path, text.into_bytes())
            .await
            .map_err(StageError::Ocr)?;
        job.artifacts.text = Some(text_path);
        self.store.update(job).await.map_err(StageError::Ocr)
    }

    /// Call the LLM and store its response verbatim.
    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    async fn extract(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.persister
            .enter(job, JobStage::Extract, StageError::Extraction)
            .await?;
        let text_path = required_artifact(&job.artifacts.text, "OCR text")
            .map_err(StageError::Extraction)?;
        let text = tokio::fs::read_to_string(&text_path)
            .await
            .with_context(|| format!("cannot read {:?}", text_path))
            .map_err(StageError::Extraction)?;
        debug!(
            model = self.extractor.model(),
            chars = text.len(),
            "Extracting fields"
        );
        let raw = self
            .extractor
            .extract(&job.id, &text)
            .await
            .map_err(StageError::Extraction)?;
        let raw_path = self.layout.raw_response(&job.id);
        write_json_atomic(&raw_path, &raw)
            .await
            .map_err(StageError::Extraction)?;
        job.artifacts.raw_response = Some(raw_path);
        job.token_usage = raw.token_usage;
        self.store.update(job).await.map_err(StageError::Extraction)
    }
}

/// Get an artifact path that an earlier stage should have produced.
fn required_artifact(artifact: &Option<PathBuf>, what: &str) -> Result<PathBuf> {
    artifact
        .clone()
        .ok_or_else(|| anyhow!("no {} from the previous stage", what))
}

/// Counts for a batch of files.
#[derive(Clone, Debug, Default)]
pub struct BatchSummary {
    /// Jobs that finished successfully.
    pub succeeded: usize,

    /// Jobs that failed, plus files we couldn't even start.
    pub failed: usize,

    /// Inputs skipped because they were already processed.
    pub duplicates: usize,

    /// Total LLM token usage.
    pub token_usage: TokenUsage,
}

impl BatchSummary {
    /// Count an outcome.
    pub fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Processed(job) => {
                if job.status == JobStatus::Done {
                    self.succeeded += 1;
                } else {
                    self.failed += 1;
                }
                if let Some(token_usage) = &job.token_usage {
                    self.token_usage += token_usage.clone();
                }
            }
            ProcessOutcome::Duplicate(job) => {
                debug!(job_id = %job.id, "Counted duplicate input");
                self.duplicates += 1;
            }
        }
    }

    /// Add another summary to this one.
    pub fn merge(&mut self, other: BatchSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
        self.token_usage += other.token_usage;
    }

    /// How many files did we run through the pipeline?
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Show the summary and check the failure rate.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        ui.display_message(
            "📊",
            &format!(
                "{} succeeded, {} failed, {} duplicates skipped",
                self.succeeded, self.failed, self.duplicates
            ),
        );
        if !self.token_usage.is_zero() {
            ui.display_message(
                "📈",
                &format!(
                    "{} input tokens and {} output tokens used",
                    self.token_usage.prompt_tokens, self.token_usage.completion_tokens,
                ),
            );
        }
        self.check_failure_rate(allowed_failure_rate)
    }

    /// Fail if too many jobs failed.
    pub fn check_failure_rate(&self, allowed_failure_rate: f32) -> Result<()> {
        if self.processed() == 0 {
            return Ok(());
        }
        let failure_rate = self.failed as f32 / self.processed() as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of résumés failed, but only {:.2}% were allowed",
                self.failed,
                self.processed(),
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}
