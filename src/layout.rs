//! Where everything lives on disk.
//!
//! Every per-job path is keyed by the job ID, so concurrent jobs never write
//! to the same file.

use crate::prelude::*;

/// Which archive a source PDF goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Done,
    Failed,
    Duplicates,
}

impl ArchiveKind {
    fn dir_name(self) -> &'static str {
        match self {
            ArchiveKind::Done => "done",
            ArchiveKind::Failed => "failed",
            ArchiveKind::Duplicates => "duplicates",
        }
    }
}

/// Our directory layout.
#[derive(Clone, Debug)]
pub struct Layout {
    /// Where new PDFs are dropped.
    pub input_dir: PathBuf,

    /// Job records, intermediate artifacts and archives.
    pub work_dir: PathBuf,

    /// Published résumé JSON.
    pub output_dir: PathBuf,
}

impl Layout {
    /// Create all top-level directories.
    pub async fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            self.input_dir.clone(),
            self.jobs_dir(),
            self.archive_dir(ArchiveKind::Done),
            self.archive_dir(ArchiveKind::Failed),
            self.archive_dir(ArchiveKind::Duplicates),
            self.output_dir.clone(),
        ];
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create directory {:?}", dir))?;
        }
        Ok(())
    }

    /// List the PDFs waiting in the input directory, sorted by name.
    pub async fn list_input_pdfs(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.input_dir)
            .await
            .with_context(|| format!("failed to read input directory {:?}", self.input_dir))?;
        let mut pdfs = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to read input directory {:?}", self.input_dir))?
        {
            let path = entry.path();
            let is_pdf = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
            if is_pdf && entry.file_type().await.is_ok_and(|ft| ft.is_file()) {
                pdfs.push(path);
            }
        }
        pdfs.sort();
        Ok(pdfs)
    }

    /// The directory holding one subdirectory per job.
    pub fn jobs_dir(&self) -> PathBuf {
        self.work_dir.join("jobs")
    }

    /// The directory for a single job's artifacts.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(job_id)
    }

    pub fn job_record(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    pub fn source_copy(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("source.pdf")
    }

    pub fn pages_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("pages")
    }

    pub fn text(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("text.txt")
    }

    pub fn raw_response(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("raw_response.json")
    }

    pub fn parsed(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("parsed.json")
    }

    /// The published output for a job.
    pub fn output(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.json", job_id))
    }

    pub fn archive_dir(&self, kind: ArchiveKind) -> PathBuf {
        self.work_dir.join("archive").join(kind.dir_name())
    }

    /// Where a job's source PDF is archived. Duplicates get a timestamp,
    /// because the same file may be dropped more than once.
    pub fn archived_source(&self, kind: ArchiveKind, job_id: &str, timestamp: &str) -> PathBuf {
        let file_name = match kind {
            ArchiveKind::Duplicates => format!("{}-{}.pdf", job_id, timestamp),
            ArchiveKind::Done | ArchiveKind::Failed => format!("{}.pdf", job_id),
        };
        self.archive_dir(kind).join(file_name)
    }
}
