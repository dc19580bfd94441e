//! The [`ResumeJob`] record and its stage machine.

use std::fmt;

use schemars::JsonSchema;
use sha2::{Digest as _, Sha256};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    error::{FailureKind, StageError},
    extract::TokenUsage,
    prelude::*,
};

/// Pipeline stages, in the only order a job may visit them.
#[derive(
    Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Claim the PDF from the input directory.
    Intake,
    /// Convert each page to an image.
    Rasterize,
    /// Turn page images into text.
    Ocr,
    /// Ask the LLM for structured fields.
    Extract,
    /// Parse and validate the LLM response, then write outputs.
    Validate,
    /// Move the source PDF into the archive.
    Archive,
}

impl JobStage {
    /// Every stage, in order.
    pub const ALL: [JobStage; 6] = [
        JobStage::Intake,
        JobStage::Rasterize,
        JobStage::Ocr,
        JobStage::Extract,
        JobStage::Validate,
        JobStage::Archive,
    ];

    /// The stage after this one.
    pub fn next(self) -> Option<JobStage> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStage::Intake => "intake",
            JobStage::Rasterize => "rasterize",
            JobStage::Ocr => "ocr",
            JobStage::Extract => "extract",
            JobStage::Validate => "validate",
            JobStage::Archive => "archive",
        };
        f.write_str(name)
    }
}

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a job failed.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct JobError {
    /// The stage that failed.
    pub stage: JobStage,

    /// The kind of failure.
    pub kind: FailureKind,

    /// A human-readable description, including the full context chain.
    pub message: String,
}

/// Paths to everything a job has produced so far.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Artifacts {
    /// The working copy of the input PDF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,

    /// Rasterized page images, in page order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<PathBuf>,

    /// Cleaned OCR text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<PathBuf>,

    /// The raw LLM response, stored before any parsing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<PathBuf>,

    /// The validated résumé, inside the job directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<PathBuf>,

    /// The published résumé in the output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,

    /// Where the source PDF ended up after archiving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_source: Option<PathBuf>,
}

/// One PDF résumé moving through the pipeline.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ResumeJob {
    /// Unique, deterministic job ID. See [`job_id_for`].
    pub id: String,

    /// The file name as it appeared in the input directory.
    pub original_name: String,

    /// Where the file was found.
    pub source_path: PathBuf,

    /// Hex SHA-256 of the input file's bytes. Used to tell a re-dropped copy
    /// from a different file with the same name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,

    /// The last stage entered.
    pub stage: JobStage,

    /// Lifecycle status.
    pub status: JobStatus,

    /// Artifacts produced so far.
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Set when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,

    /// How many times this job has been started.
    pub attempts: u32,

    /// Page count reported by the rasterizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,

    /// LLM token usage for the most recent extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    /// RFC 3339 creation time.
    pub created_at: String,

    /// RFC 3339 time of the last change.
    pub updated_at: String,
}

impl ResumeJob {
    /// Create a new pending job for a file found in the input directory.
    pub fn new(source_path: &Path) -> Result<Self> {
        let original_name = file_name_of(source_path)?;
        let now = now_rfc3339();
        Ok(Self {
            id: job_id_for(&original_name),
            original_name,
            source_path: source_path.to_owned(),
            content_sha256: None,
            stage: JobStage::Intake,
            status: JobStatus::Pending,
            artifacts: Artifacts::default(),
            error: None,
            attempts: 1,
            page_count: None,
            token_usage: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Reset a previously failed (or interrupted) job so it can run again
    /// from intake. The artifacts of the old attempt are forgotten here and
    /// overwritten on disk as the new attempt progresses.
    pub fn restart(&mut self, source_path: &Path, content_sha256: String) {
        self.source_path = source_path.to_owned();
        self.content_sha256 = Some(content_sha256);
        self.stage = JobStage::Intake;
        self.status = JobStatus::Pending;
        self.artifacts = Artifacts::default();
        self.error = None;
        self.attempts += 1;
        self.page_count = None;
        self.token_usage = None;
        self.touch();
    }

    /// Enter `stage`. Stages must be entered strictly in order, and never
    /// after a failure.
    pub fn begin(&mut self, stage: JobStage) -> Result<()> {
        let expected = match self.status {
            JobStatus::Pending => Some(JobStage::Intake),
            JobStatus::Processing => self.stage.next(),
            JobStatus::Done | JobStatus::Failed => None,
        };
        if expected != Some(stage) {
            return Err(anyhow!(
                "job {} cannot enter stage {} while {} at stage {}",
                self.id,
                stage,
                self.status,
                self.stage,
            ));
        }
        self.stage = stage;
        self.status = JobStatus::Processing;
        self.touch();
        Ok(())
    }

    /// Mark the current stage as failed.
    pub fn fail(&mut self, err: &StageError) {
        self.status = JobStatus::Failed;
        self.error = Some(JobError {
            stage: self.stage,
            kind: err.kind(),
            message: err.to_string(),
        });
        self.touch();
    }

    /// Mark the job as done. Only valid once the final stage has been entered.
    pub fn finish(&mut self) -> Result<()> {
        if self.status != JobStatus::Processing || self.stage != JobStage::Archive {
            return Err(anyhow!(
                "job {} cannot finish while {} at stage {}",
                self.id,
                self.status,
                self.stage,
            ));
        }
        self.status = JobStatus::Done;
        self.touch();
        Ok(())
    }

    /// Rewind a job whose raw response is on disk so that parsing and
    /// validation can be re-run without calling the LLM again.
    pub fn rewind_for_reparse(&mut self) -> Result<()> {
        if self.artifacts.raw_response.is_none() || self.stage < JobStage::Extract {
            return Err(anyhow!(
                "job {} has no stored raw response to re-parse",
                self.id
            ));
        }
        if self.status == JobStatus::Failed
            && self.error.as_ref().map(|e| e.stage) == Some(JobStage::Extract)
        {
            return Err(anyhow!(
                "job {} failed during extraction; its raw response is incomplete",
                self.id
            ));
        }
        self.stage = JobStage::Extract;
        self.status = JobStatus::Processing;
        self.error = None;
        self.artifacts.parsed = None;
        self.artifacts.output = None;
        self.touch();
        Ok(())
    }

    /// Update `updated_at`.
    fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

/// Compute the job ID for a file name.
///
/// The ID is a sanitized version of the file stem, plus a short hash of the
/// full file name. Names that sanitize to the same stem (`"CV (1).pdf"` and
/// `"cv_1.pdf"`) still get different IDs, and the same file name always maps
/// to the same ID.
pub fn job_id_for(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut slug = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "resume" } else { slug };
    let digest = Sha256::digest(file_name.as_bytes());
    format!("{}-{}", slug, &hex::encode(digest)[..8])
}

/// The job ID for a file whose name already belongs to a different, published
/// file: the usual ID plus a short hash of the contents.
pub fn job_id_for_contents(file_name: &str, content_sha256: &str) -> String {
    let short = content_sha256.get(..8).unwrap_or(content_sha256);
    format!("{}-{}", job_id_for(file_name), short)
}

/// Hex SHA-256 of a file's contents.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {:?}", path))?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// Get the file name of a path as a `String`.
fn file_name_of(path: &Path) -> Result<String> {
    Ok(path
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no file name", path))?
        .to_string_lossy()
        .into_owned())
}

/// The current time in RFC 3339 format.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// A compact UTC timestamp suitable for file names.
pub fn file_timestamp() -> String {
    let format = time::macros::format_description!(
        "[year][month][day]-[hour][minute][second]"
    );
    OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> ResumeJob {
        ResumeJob::new(Path::new("input/Jane Doe CV.pdf")).unwrap()
    }

    #[test]
    fn job_ids_are_stable_and_distinct() {
        let a = job_id_for("Jane Doe CV.pdf");
        assert_eq!(a, job_id_for("Jane Doe CV.pdf"));
        assert!(a.starts_with("jane_doe_cv-"), "{a}");
        assert_eq!(a.len(), "jane_doe_cv-".len() + 8);

        // Same slug, different names.
        assert_ne!(job_id_for("CV (1).pdf"), job_id_for("cv_1.pdf"));
        assert_eq!(&job_id_for("???.pdf")[..7], "resume-");

        let hash = "0123456789abcdef".repeat(4);
        assert_eq!(
            job_id_for_contents("Jane Doe CV.pdf", &hash),
            format!("{a}-01234567")
        );
    }

    #[tokio::test]
    async fn file_hashes_follow_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (a, b) = (dir.path().join("a.pdf"), dir.path().join("b.pdf"));
        tokio::fs::write(&a, b"%PDF-1.4 jane").await?;
        tokio::fs::write(&b, b"%PDF-1.4 john").await?;
        let hash = file_sha256(&a).await?;
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, file_sha256(&a).await?);
        assert_ne!(hash, file_sha256(&b).await?);
        Ok(())
    }

    #[test]
    fn stages_advance_strictly_in_order() {
        let mut job = new_job();
        assert!(job.begin(JobStage::Rasterize).is_err());
        for stage in JobStage::ALL {
            job.begin(stage).unwrap();
            assert_eq!(job.stage, stage);
        }
        assert!(job.begin(JobStage::Archive).is_err());
        job.finish().unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn stages_cannot_be_skipped() {
        let mut job = new_job();
        job.begin(JobStage::Intake).unwrap();
        assert!(job.begin(JobStage::Ocr).is_err());
        assert_eq!(job.stage, JobStage::Intake);
    }

    #[test]
    fn failure_stops_forward_progress() {
        let mut job = new_job();
        job.begin(JobStage::Intake).unwrap();
        job.begin(JobStage::Rasterize).unwrap();
        job.fail(&StageError::Conversion(anyhow!("not a PDF")));

        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.clone().unwrap();
        assert_eq!(error.stage, JobStage::Rasterize);
        assert_eq!(error.kind, FailureKind::Conversion);
        assert!(job.begin(JobStage::Ocr).is_err());
        assert!(job.finish().is_err());
        assert_eq!(job.stage, JobStage::Rasterize);
    }

    #[test]
    fn restart_clears_the_previous_attempt() {
        let mut job = new_job();
        job.begin(JobStage::Intake).unwrap();
        job.artifacts.source = Some("work/jobs/x/source.pdf".into());
        job.fail(&StageError::Intake(anyhow!("disk full")));
        job.restart(Path::new("input/Jane Doe CV.pdf"), "ab".repeat(32));

        assert_eq!(job.attempts, 2);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert_eq!(job.artifacts, Artifacts::default());
        assert_eq!(job.content_sha256, Some("ab".repeat(32)));
        job.begin(JobStage::Intake).unwrap();
    }

    #[test]
    fn reparse_requires_a_complete_raw_response() {
        let mut job = new_job();
        for stage in [JobStage::Intake, JobStage::Rasterize, JobStage::Ocr] {
            job.begin(stage).unwrap();
        }
        assert!(job.rewind_for_reparse().is_err());

        job.begin(JobStage::Extract).unwrap();
        job.artifacts.raw_response = Some("raw_response.json".into());
        job.begin(JobStage::Validate).unwrap();
        job.fail(&StageError::Validation(vec!["missing name".to_owned()]));

        job.rewind_for_reparse().unwrap();
        assert_eq!(job.stage, JobStage::Extract);
        job.begin(JobStage::Validate).unwrap();
    }

    #[test]
    fn job_records_round_trip_through_json() {
        let job = new_job();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["stage"], "intake");
        let back: ResumeJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
