use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Extension of every job file.
pub const JOB_EXTENSION: &str = ".json";

/// Suffix the retention sweeper adds when a demoted job collides with an
/// existing failed file.
pub const EXPIRED_SUFFIX: &str = ".expired";

/// Prefix of in-progress writes; never visible as a job.
pub const TEMP_PREFIX: &str = ".tmp_";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S%3f";
const TIMESTAMP_LEN: usize = 18;
const KEY_LEN: usize = 16;

/// Identifier of a job: its filename.
///
/// Filenames look like `20250314-093015123_0123456789abcdef.json`, so a
/// lexicographic sort approximates submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    name: String,
}

impl JobId {
    /// Build the filename for a job admitted at `at` under `idem_key`.
    #[must_use]
    pub fn new(at: DateTime<Utc>, idem_key: &str) -> Self {
        Self {
            name: format!(
                "{}_{idem_key}{JOB_EXTENSION}",
                at.format(TIMESTAMP_FORMAT)
            ),
        }
    }

    /// Parse a job id from a filename
    ///
    /// # Security
    /// Rejects path separators, `..`, temporary files and anything not shaped
    /// like a job filename.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        if filename.starts_with('.') {
            return None;
        }

        let stem = filename.strip_suffix(JOB_EXTENSION)?;
        let stem = stem.strip_suffix(EXPIRED_SUFFIX).unwrap_or(stem);
        let (timestamp, key) = stem.split_once('_')?;

        if timestamp.len() != TIMESTAMP_LEN
            || NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_err()
        {
            return None;
        }

        if key.len() != KEY_LEN || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        Some(Self {
            name: filename.to_string(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The idempotency key embedded in the filename.
    #[must_use]
    pub fn idem_key(&self) -> &str {
        let start = TIMESTAMP_LEN + 1;
        &self.name[start..start + KEY_LEN]
    }

    /// Admission time encoded in the filename.
    #[must_use]
    pub fn admitted_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.name[..TIMESTAMP_LEN], TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// The name used when this job is demoted into a directory that already
    /// holds a file of the same name.
    #[must_use]
    pub fn expired_name(&self) -> String {
        let stem = self
            .name
            .strip_suffix(JOB_EXTENSION)
            .unwrap_or(&self.name);
        format!("{stem}{EXPIRED_SUFFIX}{JOB_EXTENSION}")
    }
}

impl serde::Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The state of a job is the directory that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpoolState {
    Queued,
    Sent,
    Failed,
}

impl SpoolState {
    pub const ALL: [Self; 3] = [Self::Queued, Self::Sent, Self::Failed];

    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for SpoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for SpoolState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown spool state '{other}'")),
        }
    }
}

/// A job as seen by a directory listing: which file, in which state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: JobId,
    pub state: SpoolState,
}

impl JobHandle {
    #[must_use]
    pub const fn new(id: JobId, state: SpoolState) -> Self {
        Self { id, state }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.id)
    }
}
