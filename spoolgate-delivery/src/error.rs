//! Typed error handling for delivery attempts.
//!
//! The worker only needs one decision from an error: retry or not.
//! - Permanent failures (5xx replies, bad addresses, missing configuration)
//!   fail the job straight away
//! - Transient failures (4xx replies, network trouble, timeouts) are retried
//! - System errors are internal problems and are retried like transient ones

use thiserror::Error;

use crate::smtp::ClientError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Failures that will not go away by trying again.
#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("No recipients")]
    NoRecipients,

    #[error("No sender: neither the job nor the configuration supplies a from address")]
    NoSender,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The server replied with a 5xx code.
    #[error("Message rejected: {0}")]
    MessageRejected(String),
}

#[derive(Debug, Error)]
pub enum TransientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server replied with a 4xx code.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }
}

/// Categorise SMTP client errors by reply code and failure kind:
///
/// - **4xx** → Transient
/// - **5xx** → Permanent
/// - **I/O, closed connection, timeout** → Transient
/// - **Unparsable or unexpected replies** → System
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (400..500).contains(&code) => {
                Self::Transient(TransientError::SmtpTemporary(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } if (500..600).contains(&code) => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }

            ClientError::SmtpError { code, message } => Self::System(SystemError::Internal(
                format!("Unexpected SMTP response: {code} {message}"),
            )),

            ClientError::Io(e) => {
                Self::Transient(TransientError::ConnectionFailed(format!("I/O error: {e}")))
            }

            ClientError::ConnectionClosed => Self::Transient(TransientError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )),

            ClientError::Timeout(stage) => Self::Transient(TransientError::Timeout(stage)),

            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {msg}"
            ))),
        }
    }
}
