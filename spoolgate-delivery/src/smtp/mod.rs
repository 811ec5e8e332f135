//! Delivery to a single configured SMTP relay.

mod client;
mod response;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
pub use client::{ClientError, SmtpClient};
pub use response::{Response, ResponseLine};
use serde::Deserialize;
use spoolgate_common::tracing::{self, debug, warn};

use crate::{
    error::{DeliveryError, PermanentError},
    mime,
    transport::{MailTransport, OutgoingMail},
};

const MIN_TIMEOUT_SECS: u64 = 5;

const fn default_port() -> u16 {
    25
}

fn default_helo() -> String {
    String::from("localhost")
}

const fn default_timeout_secs() -> u64 {
    20
}

/// Relay settings
///
/// # Examples
///
/// ```ron
/// smtp: (
///     host: Some("relay.internal"),
///     port: 2525,
///     from: Some("noreply@example.com"),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Relay host; delivery fails permanently while this is unset
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Name announced in EHLO/HELO
    #[serde(default = "default_helo")]
    pub helo: String,

    /// Sender used when a job has none
    #[serde(default)]
    pub from: Option<String>,

    /// Connect and per-reply timeout, at least 5 seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            helo: default_helo(),
            from: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SmtpConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(MIN_TIMEOUT_SECS))
    }

    /// Apply `SMTP_HOST`, `SMTP_PORT`, `SMTP_FROM` and `SMTP_HELO` overrides
    /// looked up through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_blank = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_blank("SMTP_HOST") {
            self.host = Some(host);
        }

        if let Some(port) = non_blank("SMTP_PORT") {
            match port.trim().parse() {
                Ok(port) => self.port = port,
                Err(e) => warn!("Ignoring SMTP_PORT={port}: {e}"),
            }
        }

        if let Some(from) = non_blank("SMTP_FROM") {
            self.from = Some(from);
        }

        if let Some(helo) = non_blank("SMTP_HELO") {
            self.helo = helo;
        }
    }
}

/// Structural address check; also guards the SMTP commands against injection.
fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.is_empty()
        && !address
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
}

fn check_address(address: &str) -> Result<(), DeliveryError> {
    if is_valid_address(address) {
        Ok(())
    } else {
        Err(PermanentError::InvalidAddress(address.to_string()).into())
    }
}

#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &SmtpConfig {
        &self.config
    }

    async fn transaction(
        &self,
        addr: &str,
        from: &str,
        mail: &OutgoingMail,
        message: &str,
    ) -> Result<(), ClientError> {
        let mut client = SmtpClient::connect(addr, self.config.timeout()).await?;

        client.read_greeting().await?;
        client.hello(&self.config.helo).await?;
        client.mail_from(from).await?;
        for recipient in mail.recipients() {
            client.rcpt_to(recipient).await?;
        }
        client.data(message).await?;

        // The message is accepted at this point
        if let Err(e) = client.quit().await {
            debug!(error = %e, "QUIT failed after the message was accepted");
        }

        Ok(())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(to = ?mail.to))]
    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), DeliveryError> {
        let host = self
            .config
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PermanentError::Configuration("SMTP host is not set".to_string()))?;

        let from = mail
            .from
            .as_deref()
            .or(self.config.from.as_deref())
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .ok_or(PermanentError::NoSender)?;

        if mail.to.is_empty() {
            return Err(PermanentError::NoRecipients.into());
        }

        check_address(from)?;
        for recipient in mail.recipients() {
            check_address(recipient)?;
        }

        let domain = from.rsplit_once('@').map_or(host, |(_, domain)| domain);
        let message_id = format!("<{}@{domain}>", ulid::Ulid::new());
        let message = mime::render(mail, from, Utc::now(), &message_id);

        let addr = format!("{host}:{}", self.config.port);
        self.transaction(&addr, from, mail, &message).await?;

        debug!(%addr, %message_id, "Relay accepted message");
        Ok(())
    }
}
