//! Day-bucketed record of request ids that were delivered.
//!
//! Layout: `idem/<yyyyMMdd>/<16-hex-key>.done`. The marker content is the
//! delivery timestamp and is advisory only; existence is what matters.

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, Utc};
use spoolgate_common::tracing::{debug, warn};
use tokio::fs;

use crate::types::TEMP_PREFIX;

const BUCKET_FORMAT: &str = "%Y%m%d";
const MARKER_EXTENSION: &str = ".done";

/// A day bucket directory as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub path: PathBuf,
    /// `None` when the directory name is not a `yyyyMMdd` date.
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct IdempotencyIndex {
    root: PathBuf,
    keep_days: u32,
}

impl IdempotencyIndex {
    /// Create an index under `root`, keeping `keep_days` whole day buckets
    /// when pruning after a write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, keep_days: u32) -> Self {
        Self {
            root: root.into(),
            keep_days: keep_days.max(1),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn bucket_name(day: NaiveDate) -> String {
        day.format(BUCKET_FORMAT).to_string()
    }

    /// Parse a bucket directory name back into its day.
    #[must_use]
    pub fn parse_bucket_name(name: &str) -> Option<NaiveDate> {
        if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDate::parse_from_str(name, BUCKET_FORMAT).ok()
    }

    #[must_use]
    pub fn bucket_dir(&self, day: NaiveDate) -> PathBuf {
        self.root.join(Self::bucket_name(day))
    }

    fn marker_path(&self, key: &str, day: NaiveDate) -> PathBuf {
        self.bucket_dir(day).join(format!("{key}{MARKER_EXTENSION}"))
    }

    /// Whether a marker for `key` exists in the bucket of `now`'s UTC day.
    ///
    /// # Errors
    /// Returns an error if the filesystem cannot answer
    pub async fn contains(&self, key: &str, now: DateTime<Utc>) -> io::Result<bool> {
        fs::try_exists(self.marker_path(key, now.date_naive())).await
    }

    /// Record that the request behind `key` was delivered at `now`.
    ///
    /// Safe to call repeatedly and concurrently for the same key; every
    /// write goes through its own temporary file and the marker is replaced
    /// atomically. Buckets
    /// that fell out of the idempotency window are pruned afterwards.
    ///
    /// # Errors
    /// Returns an error if the marker cannot be written
    pub async fn mark(&self, key: &str, now: DateTime<Utc>) -> io::Result<()> {
        let dir = self.bucket_dir(now.date_naive());
        fs::create_dir_all(&dir).await?;

        let marker = self.marker_path(key, now.date_naive());
        let temp = dir.join(format!("{TEMP_PREFIX}{}{MARKER_EXTENSION}", ulid::Ulid::new()));

        fs::write(&temp, now.to_rfc3339()).await?;
        fs::rename(&temp, &marker).await?;

        debug!(key, marker = %marker.display(), "Wrote idempotency marker");

        if let Err(e) = self.prune(now).await {
            warn!(error = %e, "Failed to prune idempotency buckets");
        }

        Ok(())
    }

    /// List every bucket directory.
    ///
    /// # Errors
    /// Returns an error if the index root cannot be read
    pub async fn buckets(&self) -> io::Result<Vec<Bucket>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut buckets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let name = entry.file_name();
            buckets.push(Bucket {
                path: entry.path(),
                date: Self::parse_bucket_name(&name.to_string_lossy()),
            });
        }

        buckets.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(buckets)
    }

    /// Remove dated buckets older than the idempotency window.
    ///
    /// Undated directories are left for the retention sweeper.
    ///
    /// # Errors
    /// Returns an error if the bucket listing fails; individual delete
    /// failures are logged and skipped
    pub async fn prune(&self, now: DateTime<Utc>) -> io::Result<usize> {
        let cutoff = now.date_naive() - chrono::Days::new(u64::from(self.keep_days));
        let mut removed = 0;

        for bucket in self.buckets().await? {
            let Some(date) = bucket.date else { continue };
            if date >= cutoff {
                continue;
            }

            match fs::remove_dir_all(&bucket.path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    debug!(bucket = %bucket.path.display(), error = %e, "Cannot remove idempotency bucket");
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_bucket_names() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        assert_eq!(IdempotencyIndex::bucket_name(day), "20250304");
        assert_eq!(IdempotencyIndex::parse_bucket_name("20250304"), Some(day));
        assert_eq!(IdempotencyIndex::parse_bucket_name("2025034"), None);
        assert_eq!(IdempotencyIndex::parse_bucket_name("2025-3-4"), None);
        assert_eq!(IdempotencyIndex::parse_bucket_name("20251304"), None);
    }

    #[tokio::test]
    async fn test_mark_and_contains() {
        let dir = tempfile::tempdir().unwrap();
        let index = IdempotencyIndex::new(dir.path().join("idem"), 1);
        let now = Utc::now();

        assert!(!index.contains("0123456789abcdef", now).await.unwrap());

        index.mark("0123456789abcdef", now).await.unwrap();
        index.mark("0123456789abcdef", now).await.unwrap();

        assert!(index.contains("0123456789abcdef", now).await.unwrap());
        assert!(!index.contains("fedcba9876543210", now).await.unwrap());

        // Only checked against today's bucket
        let tomorrow = now + chrono::Duration::days(1);
        assert!(!index.contains("0123456789abcdef", tomorrow).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_after_mark() {
        let dir = tempfile::tempdir().unwrap();
        let index = IdempotencyIndex::new(dir.path().join("idem"), 2);

        let old = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap();

        index.mark("aaaaaaaaaaaaaaaa", old).await.unwrap();
        index.mark("bbbbbbbbbbbbbbbb", recent).await.unwrap();
        std::fs::create_dir_all(dir.path().join("idem").join("scratch")).unwrap();

        index.mark("cccccccccccccccc", now).await.unwrap();

        let names: Vec<_> = index
            .buckets()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["20250109", "20250110", "scratch"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_marks_of_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let index = IdempotencyIndex::new(dir.path().join("idem"), 1);
        let now = Utc::now();

        for _ in 0..50 {
            let mut writers = tokio::task::JoinSet::new();
            for _ in 0..4 {
                let index = index.clone();
                writers.spawn(async move { index.mark("0123456789abcdef", now).await });
            }

            while let Some(joined) = writers.join_next().await {
                joined.unwrap().unwrap();
            }
        }

        assert!(index.contains("0123456789abcdef", now).await.unwrap());

        let leftovers: Vec<_> = std::fs::read_dir(index.bucket_dir(now.date_naive()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
