use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::ValidationError;

const fn default_idempotency_hours() -> u32 {
    24
}

const fn default_max_body_chars() -> usize {
    200_000
}

const fn default_max_subject_chars() -> usize {
    300
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/spool/spoolgate")
}

/// Configuration for the spool store.
///
/// # Examples
///
/// ```ron
/// Spoolgate (
///     spool: (
///         root: "/var/spool/spoolgate",
///         idempotency_hours: 48,
///     ),
/// )
/// ```
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Directory holding `queued/`, `sent/`, `failed/` and `idem/`
    root: PathBuf,
    /// How long a delivered request id keeps suppressing duplicates
    pub idempotency_hours: u32,
    /// Ceiling for the larger of the text and HTML bodies
    pub max_body_chars: usize,
    /// Ceiling for the subject line
    pub max_subject_chars: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            idempotency_hours: default_idempotency_hours(),
            max_body_chars: default_max_body_chars(),
            max_subject_chars: default_max_subject_chars(),
        }
    }
}

impl<'de> Deserialize<'de> for SpoolConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct SpoolConfigHelper {
            #[serde(default = "default_root")]
            root: PathBuf,
            #[serde(default = "default_idempotency_hours")]
            idempotency_hours: u32,
            #[serde(default = "default_max_body_chars")]
            max_body_chars: usize,
            #[serde(default = "default_max_subject_chars")]
            max_subject_chars: usize,
        }

        let helper = SpoolConfigHelper::deserialize(deserializer)?;
        SpoolConfig::validate_root(&helper.root).map_err(serde::de::Error::custom)?;

        Ok(Self {
            root: helper.root,
            idempotency_hours: helper.idempotency_hours,
            max_body_chars: helper.max_body_chars,
            max_subject_chars: helper.max_subject_chars,
        })
    }
}

impl SpoolConfig {
    /// Validate a spool root
    ///
    /// # Errors
    /// Rejects relative paths, `..` components and system directories
    pub fn validate_root(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDirectory(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    /// Create a config rooted at `root` with default limits
    ///
    /// # Errors
    /// Returns an error if the root fails [`Self::validate_root`]
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let root = root.into();
        Self::validate_root(&root)?;
        Ok(Self {
            root,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of whole day buckets the idempotency index keeps, at least one.
    #[must_use]
    pub const fn idempotency_days(&self) -> u32 {
        let days = self.idempotency_hours.div_ceil(24);
        if days == 0 { 1 } else { days }
    }
}
