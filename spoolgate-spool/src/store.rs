use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use spoolgate_common::{
    internal,
    tracing::{self, debug, info, warn},
};
use tokio::fs;

use crate::{
    config::SpoolConfig,
    error::{Result, SpoolError},
    idempotency::IdempotencyIndex,
    job::{EmailRequest, Job, idem_key},
    types::{JOB_EXTENSION, JobHandle, JobId, SpoolState, TEMP_PREFIX},
};

/// How many successive millisecond slots are tried when a job filename is
/// already taken.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueueStatus {
    Queued,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub status: EnqueueStatus,
    pub request_id: String,
    /// The job file written, absent for duplicates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobId>,
}

/// Best-effort directory counts; `-1` means the directory could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpoolStats {
    pub queued: i64,
    pub sent: i64,
    pub failed: i64,
    pub as_of: DateTime<Utc>,
}

/// File-backed job queue.
///
/// Every job is a single JSON file under `<root>/<state>/`. Admission writes
/// to a temporary name and links it into place, so the worker's directory
/// scan never sees a partial file. Transitions are a single rename, so a
/// failure leaves the job where it was.
#[derive(Debug, Clone)]
pub struct SpoolStore {
    config: SpoolConfig,
    idempotency: IdempotencyIndex,
}

impl SpoolStore {
    /// Open the spool, creating the state directories if needed and removing
    /// temporary files left behind by an interrupted write.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created or the root is not a
    /// directory
    pub async fn open(config: SpoolConfig) -> Result<Self> {
        internal!("Opening spool at {}", config.root().display());

        let root = config.root();
        if fs::try_exists(root).await? && !fs::metadata(root).await?.is_dir() {
            return Err(SpoolError::Io(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("Expected {} to be a Directory, but it is not", root.display()),
            )));
        }

        for state in SpoolState::ALL {
            fs::create_dir_all(root.join(state.dir_name())).await?;
        }

        let idempotency = IdempotencyIndex::new(root.join("idem"), config.idempotency_days());
        fs::create_dir_all(idempotency.root()).await?;

        let store = Self {
            config,
            idempotency,
        };

        let cleaned = store.cleanup_temp_files().await?;
        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned temporary files from spool"
            );
        }

        Ok(store)
    }

    /// Remove temporary job files from the state directories and temporary
    /// markers from the idempotency buckets.
    async fn cleanup_temp_files(&self) -> Result<usize> {
        let mut dirs: Vec<PathBuf> = SpoolState::ALL.iter().map(|s| self.dir(*s)).collect();
        dirs.extend(
            self.idempotency
                .buckets()
                .await?
                .into_iter()
                .map(|bucket| bucket.path),
        );

        let mut cleaned = 0;
        for dir in dirs {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    fs::remove_file(entry.path()).await?;
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }

    #[must_use]
    pub const fn config(&self) -> &SpoolConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.config.root()
    }

    #[must_use]
    pub const fn idempotency(&self) -> &IdempotencyIndex {
        &self.idempotency
    }

    #[must_use]
    pub fn dir(&self, state: SpoolState) -> PathBuf {
        self.config.root().join(state.dir_name())
    }

    #[must_use]
    pub fn path(&self, handle: &JobHandle) -> PathBuf {
        self.dir(handle.state).join(handle.id.as_str())
    }

    /// Admit a request.
    ///
    /// A request whose id was already delivered today is reported as a
    /// duplicate without writing anything. Duplicates that arrive before the
    /// first copy is delivered are not detected and are queued again.
    ///
    /// # Errors
    /// Returns an error if the idempotency index cannot be read or the job
    /// file cannot be written
    pub async fn enqueue(&self, request: EmailRequest, source_ip: &str) -> Result<EnqueueOutcome> {
        self.enqueue_at(request, source_ip, Utc::now()).await
    }

    /// [`Self::enqueue`] with an explicit admission time.
    ///
    /// # Errors
    /// See [`Self::enqueue`]
    #[tracing::instrument(level = "debug", skip(self, request), err)]
    pub async fn enqueue_at(
        &self,
        request: EmailRequest,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let request = request.normalize();
        let request_id = request.resolved_request_id();
        let key = idem_key(&request_id);

        if self.idempotency.contains(&key, now).await? {
            info!(request_id = %request_id, "Request already delivered, not queueing a duplicate");
            return Ok(EnqueueOutcome {
                status: EnqueueStatus::Duplicate,
                request_id,
                job: None,
            });
        }

        let job = Job::new(request, now, source_ip);
        let id = self.write_new(&job.to_bytes()?, now, &key).await?;

        info!(request_id = %request_id, job = %id, "Queued job");

        Ok(EnqueueOutcome {
            status: EnqueueStatus::Queued,
            request_id,
            job: Some(id),
        })
    }

    /// Write `bytes` into `queued/` under a fresh job name.
    ///
    /// The content goes to a temporary file first and is then hard-linked to
    /// its final name, which fails instead of overwriting when two jobs with
    /// the same key land in the same millisecond; the next millisecond is
    /// tried instead.
    async fn write_new(&self, bytes: &[u8], at: DateTime<Utc>, key: &str) -> Result<JobId> {
        let queued = self.dir(SpoolState::Queued);
        let temp = queued.join(format!("{TEMP_PREFIX}{}{JOB_EXTENSION}", ulid::Ulid::new()));

        fs::write(&temp, bytes).await?;

        let result = Self::link_into_place(&temp, &queued, at, key).await;
        match fs::remove_file(&temp).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                debug!(temp = %temp.display(), error = %e, "Cannot remove temporary job file");
            }
            _ => {}
        }

        result
    }

    async fn link_into_place(
        temp: &Path,
        dir: &Path,
        mut at: DateTime<Utc>,
        key: &str,
    ) -> Result<JobId> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = JobId::new(at, key);
            let target = dir.join(id.as_str());

            match fs::hard_link(temp, &target).await {
                Ok(()) => return Ok(id),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                // Filesystems without hard links: fall back to a rename,
                // guarded by an existence check.
                Err(_) => {
                    if !fs::try_exists(&target).await? {
                        fs::rename(temp, &target).await?;
                        return Ok(id);
                    }
                }
            }

            at += chrono::Duration::milliseconds(1);
        }

        Err(SpoolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("No free job name for key {key}"),
        )))
    }

    /// List the jobs in `state`, sorted by filename.
    ///
    /// Every call re-scans the directory. Temporary files and anything not
    /// named like a job are skipped.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read
    pub async fn list(&self, state: SpoolState) -> Result<Vec<JobHandle>> {
        let mut entries = fs::read_dir(self.dir(state)).await?;
        let mut jobs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = JobId::from_filename(&name.to_string_lossy()) {
                jobs.push(JobHandle::new(id, state));
            }
        }

        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    /// List queued jobs in approximate submission order.
    ///
    /// # Errors
    /// Returns an error if the queue directory cannot be read
    pub async fn list_queued(&self) -> Result<Vec<JobHandle>> {
        self.list(SpoolState::Queued).await
    }

    /// Read and parse a job file.
    ///
    /// # Errors
    /// `NotFound` if the file is gone, `MalformedJob` if it cannot be parsed
    pub async fn read(&self, handle: &JobHandle) -> Result<Job> {
        let bytes = match fs::read(self.path(handle)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(handle.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Job::parse(handle.id.as_str(), &bytes)
    }

    /// Record that `request_id` was delivered today. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the marker cannot be written
    pub async fn mark_delivered(&self, request_id: &str) -> Result<()> {
        self.idempotency
            .mark(&idem_key(request_id), Utc::now())
            .await?;
        Ok(())
    }

    /// Move a job to another state directory, replacing a file of the same
    /// name there.
    ///
    /// This is one rename: on failure the job is still in its old state.
    ///
    /// # Errors
    /// Returns an error if the rename fails
    #[tracing::instrument(level = "debug", skip(self), fields(job = %handle), err)]
    pub async fn transition(&self, handle: &JobHandle, to: SpoolState) -> Result<JobHandle> {
        let target = JobHandle::new(handle.id.clone(), to);
        if handle.state == to {
            return Ok(target);
        }

        fs::rename(self.path(handle), self.path(&target)).await?;
        Ok(target)
    }

    /// # Errors
    /// Returns an error if the rename fails
    pub async fn move_to_sent(&self, handle: &JobHandle) -> Result<JobHandle> {
        self.transition(handle, SpoolState::Sent).await
    }

    /// # Errors
    /// Returns an error if the rename fails
    pub async fn move_to_failed(&self, handle: &JobHandle) -> Result<JobHandle> {
        self.transition(handle, SpoolState::Failed).await
    }

    /// Move a queued job to `failed/` without replacing anything already
    /// there; a clash gets the `.expired` name instead.
    ///
    /// # Errors
    /// Returns an error if the rename fails
    pub async fn expire(&self, handle: &JobHandle) -> Result<JobHandle> {
        let mut target = self.dir(SpoolState::Failed).join(handle.id.as_str());
        let mut id = handle.id.clone();

        if fs::try_exists(&target).await? {
            let expired = handle.id.expired_name();
            target = self.dir(SpoolState::Failed).join(&expired);
            id = JobId::from_filename(&expired)
                .ok_or_else(|| SpoolError::NotFound(expired.clone()))?;
        }

        fs::rename(self.path(handle), &target).await?;
        Ok(JobHandle::new(id, SpoolState::Failed))
    }

    async fn count(&self, state: SpoolState) -> i64 {
        match self.list(state).await {
            Ok(jobs) => i64::try_from(jobs.len()).unwrap_or(i64::MAX),
            Err(e) => {
                warn!(state = %state, error = %e, "Cannot count spool directory");
                -1
            }
        }
    }

    /// Count the jobs in each state.
    pub async fn stats(&self) -> SpoolStats {
        SpoolStats {
            queued: self.count(SpoolState::Queued).await,
            sent: self.count(SpoolState::Sent).await,
            failed: self.count(SpoolState::Failed).await,
            as_of: Utc::now(),
        }
    }

    /// Read a failed job by filename, e.g. to inspect it before resubmitting.
    ///
    /// # Errors
    /// `NotFound` for names that are not failed jobs, `MalformedJob` if the
    /// file cannot be parsed
    pub async fn read_failed(&self, filename: &str) -> Result<(JobHandle, Job)> {
        let id = JobId::from_filename(filename)
            .ok_or_else(|| SpoolError::NotFound(filename.to_string()))?;
        let handle = JobHandle::new(id, SpoolState::Failed);
        let job = self.read(&handle).await?;
        Ok((handle, job))
    }

    /// Queue a failed job's payload again.
    ///
    /// The usual duplicate check applies. The failed copy is removed only
    /// once the new job file exists.
    ///
    /// # Errors
    /// Returns an error if the failed job cannot be read or the new job
    /// cannot be written
    pub async fn resubmit_failed(&self, filename: &str) -> Result<EnqueueOutcome> {
        let (handle, job) = self.read_failed(filename).await?;
        let outcome = self.enqueue(job.to_request(), &job.meta.ip).await?;

        if outcome.status == EnqueueStatus::Queued
            && let Err(e) = fs::remove_file(self.path(&handle)).await
        {
            warn!(job = %handle, error = %e, "Resubmitted job, but cannot remove the failed copy");
        }

        Ok(outcome)
    }
}
