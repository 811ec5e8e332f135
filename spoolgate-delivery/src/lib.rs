//! Delivery of spooled jobs.
//!
//! [`DeliveryWorker`] drains the queue through a [`MailTransport`];
//! [`SmtpTransport`] is the production transport, relaying to a single SMTP
//! server. Failures are classified by [`DeliveryError`] so that only the ones
//! worth retrying are retried.

pub mod error;
pub mod mime;
pub mod policy;
pub mod smtp;
pub mod transport;
pub mod worker;

pub use error::{DeliveryError, PermanentError, SystemError, TransientError};
pub use policy::RetryPolicy;
pub use smtp::{SmtpConfig, SmtpTransport};
pub use transport::{MailTransport, OutgoingMail};
pub use worker::{BatchReport, DeliveryConfig, DeliveryWorker, JobOutcome};
