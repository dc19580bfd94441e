//! Job bookkeeping, plus the stages that only need what's already on disk:
//! parsing and validating a stored raw response, publishing it, and
//! archiving the source.
//!
//! None of this touches poppler, tesseract or the LLM, so the same code
//! serves both a normal run and `reparse`.

use std::sync::Arc;

use crate::{
    async_utils::io::{move_file, read_json_or_toml, write_json_atomic},
    error::StageError,
    extract::{RawResponse, parse::parse_response},
    job::{JobStage, ResumeJob},
    layout::{ArchiveKind, Layout},
    prelude::*,
    resume::ParsedResume,
    store::JobStore,
    validate::Validator,
};

/// Saves job records and turns raw responses into published résumés.
pub struct Persister {
    layout: Layout,
    store: Arc<dyn JobStore>,
    validator: Validator,
}

impl Persister {
    pub fn new(layout: Layout, store: Arc<dyn JobStore>) -> Result<Self> {
        Ok(Self {
            layout,
            store,
            validator: Validator::new()?,
        })
    }

    /// Enter a stage and save the job, wrapping any error as a failure of
    /// that stage.
    pub(super) async fn enter(
        &self,
        job: &mut ResumeJob,
        stage: JobStage,
        wrap: fn(anyhow::Error) -> StageError,
    ) -> Result<(), StageError> {
        job.begin(stage).map_err(wrap)?;
        debug!(job_id = %job.id, %stage, "Entering stage");
        self.store.update(job).await.map_err(wrap)
    }

    /// The validate stage: parse, validate and publish.
    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    pub(super) async fn validate(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.enter(job, JobStage::Validate, validation_error).await?;
        self.publish(job).await?;
        self.store.update(job).await.map_err(validation_error)
    }

    /// The archive stage: move the source PDF to `archive/done` and finish
    /// the job.
    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    pub(super) async fn archive(&self, job: &mut ResumeJob) -> Result<(), StageError> {
        self.enter(job, JobStage::Archive, StageError::Archive).await?;
        let dest = self.layout.archived_source(ArchiveKind::Done, &job.id, "");
        match self.current_source(job).await {
            Some(source) if source == dest => {}
            Some(source) => move_file(&source, &dest)
                .await
                .map_err(StageError::Archive)?,
            None => {
                return Err(StageError::Archive(anyhow!(
                    "source PDF for job {} has gone missing",
                    job.id
                )));
            }
        }
        job.artifacts.archived_source = Some(dest);
        job.finish().map_err(StageError::Archive)
    }

    /// Where is the job's source PDF right now?
    async fn current_source(&self, job: &ResumeJob) -> Option<PathBuf> {
        let candidates = [
            job.artifacts.archived_source.as_ref(),
            job.artifacts.source.as_ref(),
            Some(&job.source_path),
        ];
        for candidate in candidates.into_iter().flatten() {
            if tokio::fs::try_exists(candidate).await.unwrap_or(false) {
                return Some(candidate.to_owned());
            }
        }
        None
    }

    /// Mark the job failed, archive its source to `archive/failed`, and save
    /// it. All artifacts produced so far are kept.
    pub(super) async fn record_failure(
        &self,
        job: &mut ResumeJob,
        err: StageError,
    ) -> Result<()> {
        job.fail(&err);
        error!(
            job_id = %job.id,
            stage = %job.stage,
            kind = ?err.kind(),
            "Job failed: {}",
            err
        );

        let dest = self
            .layout
            .archived_source(ArchiveKind::Failed, &job.id, "");
        match self.current_source(job).await {
            Some(source) if source == dest => {}
            Some(source) => match move_file(&source, &dest).await {
                Ok(()) => job.artifacts.archived_source = Some(dest),
                Err(err) => error!(
                    job_id = %job.id,
                    "Cannot archive source of failed job: {:#}",
                    err
                ),
            },
            None => warn!(job_id = %job.id, "No source PDF left to archive"),
        }
        self.store.update(job).await
    }

    /// Re-run parsing and validation for a job from its stored raw response.
    ///
    /// No OCR or LLM calls are made.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    pub async fn reparse(&self, job_id: &str) -> Result<ResumeJob> {
        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("no such job: {}", job_id))?;
        job.rewind_for_reparse()?;
        self.store.update(&job).await?;

        let result = async {
            self.validate(&mut job).await?;
            self.archive(&mut job).await
        }
        .await;
        match result {
            Ok(()) => {
                info!(job_id, "Re-parsed job");
                self.store.update(&job).await?;
            }
            Err(err) => self.record_failure(&mut job, err).await?,
        }
        Ok(job)
    }

    /// Parse and validate the job's raw response, then write `parsed.json` and
    /// the output file. Updates `job.artifacts` but does not save the job.
    #[instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    pub async fn publish(&self, job: &mut ResumeJob) -> Result<ParsedResume, StageError> {
        let raw_path = job
            .artifacts
            .raw_response
            .clone()
            .ok_or_else(|| StageError::Extraction(anyhow!("no raw response recorded")))?;
        let raw = read_json_or_toml::<RawResponse>(&raw_path)
            .await
            .map_err(StageError::Extraction)?;

        let value = parse_response(raw.mode, &raw.content).map_err(StageError::Extraction)?;
        let resume = match self.validator.validate(&value) {
            Ok(resume) => resume,
            Err(problems) => {
                self.withdraw_output(&job.id).await;
                return Err(StageError::Validation(problems));
            }
        };

        let parsed_path = self.layout.parsed(&job.id);
        let output_path = self.layout.output(&job.id);
        let write_result = async {
            write_json_atomic(&parsed_path, &resume).await?;
            write_json_atomic(&output_path, &resume).await
        }
        .await;
        if let Err(err) = write_result {
            return Err(StageError::Validation(vec![format!(
                "cannot write output: {:#}",
                err
            )]));
        }
        job.artifacts.parsed = Some(parsed_path);
        job.artifacts.output = Some(output_path);
        Ok(resume)
    }

    /// Remove a previously published output that no longer validates.
    async fn withdraw_output(&self, job_id: &str) {
        let output_path = self.layout.output(job_id);
        match tokio::fs::remove_file(&output_path).await {
            Ok(()) => warn!(job_id, path = %output_path.display(), "Withdrew stale output"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(job_id, path = %output_path.display(), "Cannot remove stale output: {}", err)
            }
        }
    }
}

/// Report a bookkeeping error during validation as a validation failure.
fn validation_error(err: anyhow::Error) -> StageError {
    StageError::Validation(vec![format!("{:#}", err)])
}

#[cfg(test)]
mod tests {
    use crate::{error::FailureKind, extract::ResponseMode, store::FsJobStore};

    use super::*;

    async fn job_with_raw(
        layout: &Layout,
        mode: ResponseMode,
        content: &str,
    ) -> Result<ResumeJob> {
        let mut job = ResumeJob::new(Path::new("input/jane.pdf"))?;
        let raw_path = layout.raw_response(&job.id);
        write_json_atomic(
            &raw_path,
            &RawResponse {
                model: "test".to_owned(),
                mode,
                content: content.to_owned(),
                token_usage: None,
                duration_secs: 0.0,
                errors: vec![],
            },
        )
        .await?;
        job.artifacts.raw_response = Some(raw_path);
        Ok(job)
    }

    fn persister(layout: &Layout) -> Result<Persister> {
        Persister::new(layout.clone(), Arc::new(FsJobStore::new(layout.clone())))
    }

    fn layout(root: &Path) -> Layout {
        Layout {
            input_dir: root.join("input"),
            work_dir: root.join("work"),
            output_dir: root.join("output"),
        }
    }

    #[tokio::test]
    async fn publishes_valid_responses() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout(dir.path());
        let persister = persister(&layout)?;
        let mut job = job_with_raw(
            &layout,
            ResponseMode::Markdown,
            "### PERSONAL INFORMATION\n- **Name:** Jane Doe\n- **Email:** jane@example.com\n",
        )
        .await?;

        let resume = persister.publish(&mut job).await?;
        assert_eq!(resume.personal_info["name"].as_text(), Some("Jane Doe"));
        let output = tokio::fs::read_to_string(layout.output(&job.id)).await?;
        let parsed = tokio::fs::read_to_string(layout.parsed(&job.id)).await?;
        assert_eq!(output, parsed);
        assert_eq!(job.artifacts.output, Some(layout.output(&job.id)));
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_content_is_an_extraction_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout(dir.path());
        let persister = persister(&layout)?;
        let mut job = job_with_raw(&layout, ResponseMode::Json, "I'm sorry, I can't.").await?;
        let err = persister.publish(&mut job).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Extraction);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_responses_withdraw_stale_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = layout(dir.path());
        let persister = persister(&layout)?;
        let mut job = job_with_raw(&layout, ResponseMode::Json, r#"{"skills": []}"#).await?;
        write_json_atomic(&layout.output(&job.id), &json!({ "old": true })).await?;

        let err = persister.publish(&mut job).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(err.to_string().contains("personal_info"), "{err}");
        assert!(!layout.output(&job.id).exists());
        assert!(job.artifacts.output.is_none());
        Ok(())
    }
}
