//! Error types for the spoolgate-spool crate.
//!
//! Spool failures are either filesystem problems, a persisted file that can
//! no longer be understood, or a configuration/request that does not pass
//! validation.

use std::io;

use thiserror::Error;

/// Top-level spool error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (list, read, write, rename, delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A job could not be serialized for writing.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted job file is not a usable job.
    ///
    /// This never heals on retry: it signals a bug in admission or a file
    /// that was tampered with.
    #[error("Malformed job {name}: {reason}")]
    MalformedJob { name: String, reason: String },

    /// Job not found in the requested state directory.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Configuration or request validation failed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for spool configuration and admission payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Spool path contains `..`.
    #[error("Spool path cannot contain '..' components: {0}")]
    ParentDirectory(String),

    /// Spool path is relative.
    #[error("Spool path must be absolute: {0}")]
    NotAbsolute(String),

    /// Spool path points into a system directory.
    #[error("Spool path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    /// A required request field is absent or blank.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A request field exceeds its configured ceiling.
    #[error("Field {field} is too long (max {max})")]
    TooLong { field: &'static str, max: usize },

    /// An address is not of the form `local@domain`.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

impl SpoolError {
    pub(crate) fn malformed(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedJob {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if the error is about the content of a job file rather
    /// than the filesystem around it.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedJob { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let spool_err: SpoolError = io_err.into();
        assert!(matches!(spool_err, SpoolError::Io(_)));
        assert!(!spool_err.is_malformed());
    }

    #[test]
    fn test_malformed_message() {
        let err = SpoolError::malformed("20250101-000000000_abc.json", "expected an object");
        assert!(err.is_malformed());
        assert_eq!(
            err.to_string(),
            "Malformed job 20250101-000000000_abc.json: expected an object"
        );
    }
}
