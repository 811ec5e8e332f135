//! Retention sweeper
//!
//! Bounds the amount of terminal state kept under the spool root: old `sent`
//! and `failed` jobs, old idempotency buckets and old log files are deleted,
//! and (when configured) queued jobs that have waited too long are demoted to
//! `failed`. Every file is handled on its own; one failure never stops the
//! sweep.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spoolgate_common::{
    Signal, internal,
    tracing::{self, debug, info, warn},
};
use tokio::{fs, sync::broadcast, time::MissedTickBehavior};

use crate::{store::SpoolStore, types::SpoolState};

const MIN_INTERVAL_MINUTES: u64 = 5;

const fn default_enabled() -> bool {
    true
}

const fn default_run_every_minutes() -> u64 {
    60
}

const fn default_log_days() -> u32 {
    14
}

const fn default_sent_days() -> u32 {
    14
}

const fn default_failed_days() -> u32 {
    30
}

const fn default_idem_days() -> u32 {
    7
}

/// Retention for log files written by an external log shipper or the
/// service manager.
#[derive(Debug, Clone, Deserialize)]
pub struct LogRetention {
    /// Delete `*.log` files older than this many days
    #[serde(default = "default_log_days")]
    pub days: u32,
    /// Directory to sweep; nothing is swept when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            days: default_log_days(),
            directory: None,
        }
    }
}

/// Configuration for the retention sweeper
///
/// # Examples
///
/// ```ron
/// Spoolgate (
///     retention: (
///         run_every_minutes: 30,
///         sent_days: 7,
///         queued_max_age_days: 3,
///         logs: (directory: Some("/var/log/spoolgate")),
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Minutes between sweeps, at least 5
    #[serde(default = "default_run_every_minutes")]
    pub run_every_minutes: u64,

    #[serde(default)]
    pub logs: LogRetention,

    /// Days a delivered job is kept, at least 1
    #[serde(default = "default_sent_days")]
    pub sent_days: u32,

    /// Days a failed job is kept, at least 1
    #[serde(default = "default_failed_days")]
    pub failed_days: u32,

    /// Days an idempotency bucket is kept, at least 1
    #[serde(default = "default_idem_days")]
    pub idem_days: u32,

    /// Days a job may wait in `queued` before it is demoted to `failed`.
    ///
    /// `0` disables demotion.
    #[serde(default)]
    pub queued_max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            run_every_minutes: default_run_every_minutes(),
            logs: LogRetention::default(),
            sent_days: default_sent_days(),
            failed_days: default_failed_days(),
            idem_days: default_idem_days(),
            queued_max_age_days: 0,
        }
    }
}

fn days_before(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - chrono::Duration::days(i64::from(days.max(1)))
}

impl RetentionConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.run_every_minutes.max(MIN_INTERVAL_MINUTES) * 60)
    }
}

/// Outcome of sweeping one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepCounts {
    /// Entries deleted (or demoted, for queued jobs)
    pub removed: usize,
    /// Entries that were due but could not be handled
    pub failed: usize,
}

impl SweepCounts {
    fn record(&mut self, result: io::Result<()>, path: &Path) {
        match result {
            Ok(()) => self.removed += 1,
            Err(e) => {
                self.failed += 1;
                debug!(path = %path.display(), error = %e, "Cannot sweep entry");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub logs: SweepCounts,
    pub sent: SweepCounts,
    pub failed: SweepCounts,
    pub idem: SweepCounts,
    pub queued_expired: SweepCounts,
}

/// Periodic garbage collector for the spool root.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    config: RetentionConfig,
    store: SpoolStore,
}

async fn modified_before(path: &Path, cutoff: DateTime<Utc>) -> io::Result<bool> {
    let modified = fs::metadata(path).await?.modified()?;
    Ok(DateTime::<Utc>::from(modified) < cutoff)
}

/// Delete the files in `dir` whose name ends with `extension` and whose
/// modification time is before `cutoff`.
async fn delete_files_older_than(
    dir: &Path,
    extension: &str,
    cutoff: DateTime<Utc>,
) -> io::Result<SweepCounts> {
    let mut counts = SweepCounts::default();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(counts),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_name().to_string_lossy().ends_with(extension) {
            continue;
        }

        match entry.file_type().await {
            Ok(kind) if kind.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                counts.record(Err(e), &path);
                continue;
            }
        }

        match modified_before(&path, cutoff).await {
            Ok(true) => counts.record(fs::remove_file(&path).await, &path),
            Ok(false) => {}
            Err(e) => counts.record(Err(e), &path),
        }
    }

    Ok(counts)
}

impl RetentionSweeper {
    #[must_use]
    pub const fn new(config: RetentionConfig, store: SpoolStore) -> Self {
        Self { config, store }
    }

    #[must_use]
    pub const fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Run one full sweep as of `now`.
    ///
    /// Categories that cannot even be listed are logged and reported as
    /// empty; the other categories still run.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(dir) = &self.config.logs.directory {
            let cutoff = days_before(now, self.config.logs.days);
            report.logs = Self::logged("logs", cutoff, delete_files_older_than(dir, ".log", cutoff).await);
        }

        let cutoff = days_before(now, self.config.sent_days);
        report.sent = Self::logged(
            "sent",
            cutoff,
            delete_files_older_than(&self.store.dir(SpoolState::Sent), ".json", cutoff).await,
        );

        let cutoff = days_before(now, self.config.failed_days);
        report.failed = Self::logged(
            "failed",
            cutoff,
            delete_files_older_than(&self.store.dir(SpoolState::Failed), ".json", cutoff).await,
        );

        let cutoff = days_before(now, self.config.idem_days);
        report.idem = Self::logged("idem", cutoff, self.sweep_idempotency(cutoff).await);

        if self.config.queued_max_age_days > 0 {
            let cutoff = days_before(now, self.config.queued_max_age_days);
            report.queued_expired = self.expire_queued(cutoff).await;
        }

        report
    }

    fn logged(
        category: &str,
        cutoff: DateTime<Utc>,
        result: io::Result<SweepCounts>,
    ) -> SweepCounts {
        match result {
            Ok(counts) => {
                if counts.removed > 0 || counts.failed > 0 {
                    info!(
                        category,
                        removed = counts.removed,
                        failed = counts.failed,
                        cutoff = %cutoff.to_rfc3339(),
                        "Retention sweep"
                    );
                }
                counts
            }
            Err(e) => {
                warn!(category, error = %e, "Retention sweep could not list entries");
                SweepCounts::default()
            }
        }
    }

    /// Delete idempotency buckets for days before `cutoff`. Directories whose
    /// name is not a date are judged by their modification time.
    async fn sweep_idempotency(&self, cutoff: DateTime<Utc>) -> io::Result<SweepCounts> {
        let mut counts = SweepCounts::default();
        let cutoff_day = cutoff.date_naive();

        for bucket in self.store.idempotency().buckets().await? {
            let due = match bucket.date {
                Some(date) => date < cutoff_day,
                None => match modified_before(&bucket.path, cutoff).await {
                    Ok(due) => due,
                    Err(e) => {
                        counts.record(Err(e), &bucket.path);
                        continue;
                    }
                },
            };

            if due {
                counts.record(fs::remove_dir_all(&bucket.path).await, &bucket.path);
            }
        }

        Ok(counts)
    }

    /// Demote queued jobs last modified before `cutoff` to `failed`.
    async fn expire_queued(&self, cutoff: DateTime<Utc>) -> SweepCounts {
        let mut counts = SweepCounts::default();

        let queued = match self.store.list_queued().await {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "Retention sweep could not list queued jobs");
                return counts;
            }
        };

        for handle in queued {
            let path = self.store.path(&handle);
            match modified_before(&path, cutoff).await {
                Ok(true) => match self.store.expire(&handle).await {
                    Ok(_) => counts.removed += 1,
                    Err(e) => {
                        counts.failed += 1;
                        debug!(job = %handle, error = %e, "Cannot demote queued job");
                    }
                },
                Ok(false) => {}
                // Picked up by the worker in the meantime
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => counts.record(Err(e), &path),
            }
        }

        if counts.removed > 0 {
            warn!(
                moved = counts.removed,
                cutoff = %cutoff.to_rfc3339(),
                "Retention moved old queued jobs to failed"
            );
        }

        counts
    }

    /// Run the sweeper until shutdown.
    ///
    /// Sweeps once straight away, then every configured interval. Does
    /// nothing when retention is disabled.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        if !self.config.enabled {
            internal!(level = INFO, "Retention disabled");
            return;
        }

        let every = self.config.interval();
        internal!(
            level = INFO,
            "Retention sweeper started, interval {} minutes",
            every.as_secs() / 60
        );

        let mut timer = tokio::time::interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let report = self.sweep_once(Utc::now()).await;
                    debug!(?report, "Retention sweep complete");
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Retention sweeper received shutdown signal");
                        }
                        Err(e) => {
                            warn!("Retention sweeper shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }
    }
}
