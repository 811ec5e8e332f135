//! The capability the worker delivers through.

use async_trait::async_trait;
use spoolgate_spool::Job;

use crate::error::DeliveryError;

/// A message ready to hand to a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMail {
    /// Sender requested by the client; the transport falls back to its own
    /// configured sender when absent.
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
}

impl OutgoingMail {
    #[must_use]
    pub fn from_job(job: &Job) -> Self {
        Self {
            from: job.from.clone(),
            to: job.to_emails.clone(),
            cc: job.cc_emails.clone(),
            subject: job.subject.clone(),
            text_body: job.text_body().map(str::to_string),
            html_body: job.html_body().map(str::to_string),
        }
    }

    /// Every envelope recipient, `to` first.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(&self.cc).map(String::as_str)
    }
}

/// Something that can deliver a message.
///
/// Implementations classify their failures: a
/// [`DeliveryError::Permanent`] is never retried, anything else is.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver one message.
    ///
    /// # Errors
    /// Returns the classified reason the message was not accepted
    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), DeliveryError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_legacy_html_job() {
        let job = Job::parse(
            "job.json",
            br#"{"subject": "Hi", "body": "<b>Hi</b>", "isHtml": true,
                 "toEmails": ["a@example.com"], "ccEmails": "b@example.com"}"#,
        )
        .unwrap();

        let mail = OutgoingMail::from_job(&job);
        assert_eq!(mail.html_body.as_deref(), Some("<b>Hi</b>"));
        assert_eq!(mail.text_body, None);
        assert_eq!(
            mail.recipients().collect::<Vec<_>>(),
            vec!["a@example.com", "b@example.com"]
        );
    }

    #[test]
    fn test_from_text_and_html_job() {
        let job = Job::parse(
            "job.json",
            br#"{"subject": "Hi", "body": "Hi", "bodyHtml": "<p>Hi</p>",
                 "from": "me@example.com", "toEmails": ["a@example.com"]}"#,
        )
        .unwrap();

        let mail = OutgoingMail::from_job(&job);
        assert_eq!(mail.from.as_deref(), Some("me@example.com"));
        assert_eq!(mail.text_body.as_deref(), Some("Hi"));
        assert_eq!(mail.html_body.as_deref(), Some("<p>Hi</p>"));
    }
}
