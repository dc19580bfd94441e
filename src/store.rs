//! Job records.
//!
//! The store is the only thing that reads or writes `job.json`. Each job owns
//! its own record, so there's no locking: two concurrent jobs never touch the
//! same file.

use crate::{
    async_utils::io::{read_json_if_exists, write_json_atomic},
    job::ResumeJob,
    layout::Layout,
    prelude::*,
};

/// CRUD interface for [`ResumeJob`] records.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Store a new job. Fails if a record with the same ID exists.
    async fn create(&self, job: &ResumeJob) -> Result<()>;

    /// Look up a job by ID.
    async fn get(&self, job_id: &str) -> Result<Option<ResumeJob>>;

    /// Replace an existing job record.
    async fn update(&self, job: &ResumeJob) -> Result<()>;

    /// List all jobs, sorted by ID.
    async fn list(&self) -> Result<Vec<ResumeJob>>;

    /// Delete a job record (but not its artifacts). Part of the CRUD set, but
    /// only tests remove records so far.
    #[cfg_attr(not(test), allow(dead_code))]
    async fn delete(&self, job_id: &str) -> Result<()>;
}

/// A [`JobStore`] that keeps one JSON file per job under the work directory.
#[derive(Clone, Debug)]
pub struct FsJobStore {
    layout: Layout,
}

impl FsJobStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    #[instrument(level = "trace", skip_all, fields(job_id = %job.id))]
    async fn create(&self, job: &ResumeJob) -> Result<()> {
        let path = self.layout.job_record(&job.id);
        if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to check for {:?}", path))?
        {
            return Err(anyhow!("job {} already exists", job.id));
        }
        write_json_atomic(&path, job).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<ResumeJob>> {
        read_json_if_exists(&self.layout.job_record(job_id)).await
    }

    #[instrument(level = "trace", skip_all, fields(job_id = %job.id, stage = %job.stage, status = %job.status))]
    async fn update(&self, job: &ResumeJob) -> Result<()> {
        let path = self.layout.job_record(&job.id);
        if !tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to check for {:?}", path))?
        {
            return Err(anyhow!("job {} does not exist", job.id));
        }
        write_json_atomic(&path, job).await
    }

    async fn list(&self) -> Result<Vec<ResumeJob>> {
        let jobs_dir = self.layout.jobs_dir();
        let mut entries = match tokio::fs::read_dir(&jobs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read directory {:?}", jobs_dir));
            }
        };
        let mut jobs = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to read directory {:?}", jobs_dir))?
        {
            let job_id = entry.file_name().to_string_lossy().into_owned();
            // Directories without a record are left over from a crash during
            // intake. Skip them.
            if let Some(job) = self.get(&job_id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn delete(&self, job_id: &str) -> Result<()> {
        let path = self.layout.job_record(job_id);
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed to delete job record {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use crate::job::JobStage;

    use super::*;

    fn store(root: &Path) -> FsJobStore {
        FsJobStore::new(Layout {
            input_dir: root.join("input"),
            work_dir: root.join("work"),
            output_dir: root.join("output"),
        })
    }

    #[tokio::test]
    async fn crud_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path());
        assert!(store.list().await?.is_empty());

        let mut job = ResumeJob::new(Path::new("input/b.pdf"))?;
        store.create(&job).await?;
        assert!(store.create(&job).await.is_err());
        store
            .create(&ResumeJob::new(Path::new("input/a.pdf"))?)
            .await?;

        job.begin(JobStage::Intake)?;
        store.update(&job).await?;
        assert_eq!(store.get(&job.id).await?, Some(job.clone()));

        let ids = store
            .list()
            .await?
            .into_iter()
            .map(|j| j.original_name)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a.pdf", "b.pdf"]);

        store.delete(&job.id).await?;
        assert_eq!(store.get(&job.id).await?, None);
        assert!(store.update(&job).await.is_err());
        Ok(())
    }
}
