//! The job payload: what a client asks us to send, and how it is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{
    config::SpoolConfig,
    error::{Result, SpoolError, ValidationError},
};

/// Longest request id a client may supply.
pub const MAX_REQUEST_ID_CHARS: usize = 120;

/// Number of hex characters of the request-id hash used as idempotency key.
pub const IDEM_KEY_LEN: usize = 16;

/// An email-send request as admitted by the spool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailRequest {
    #[serde(alias = "RequestId")]
    pub request_id: Option<String>,
    #[serde(alias = "Client")]
    pub client: Option<String>,
    #[serde(alias = "From")]
    pub from: Option<String>,
    #[serde(alias = "Subject")]
    pub subject: String,
    #[serde(alias = "Body")]
    pub body: Option<String>,
    #[serde(alias = "BodyHtml")]
    pub body_html: Option<String>,
    #[serde(alias = "IsHtml")]
    pub is_html: Option<bool>,
    #[serde(alias = "ToEmails")]
    pub to_emails: Vec<String>,
    #[serde(alias = "CcEmails")]
    pub cc_emails: Vec<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clean_list(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// A structural check only: one `@` separating a non-empty local part from a
/// domain, no whitespace or angle brackets.
pub(crate) fn is_plausible_address(address: &str) -> bool {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address
            .chars()
            .any(|c| c.is_whitespace() || c == '<' || c == '>')
}

impl EmailRequest {
    /// Trim every field, turn blank optionals into `None` and drop blank
    /// recipients.
    ///
    /// Legacy clients send HTML in `body` with `is_html` set; that body is
    /// copied into `body_html` so the rest of the pipeline only looks there.
    #[must_use]
    pub fn normalize(self) -> Self {
        let body = self.body.map(|b| b.trim().to_string());
        let mut body_html = non_blank(self.body_html);

        if self.is_html == Some(true) && body_html.is_none() {
            body_html = body.clone().filter(|b| !b.is_empty());
        }

        Self {
            request_id: non_blank(self.request_id),
            client: non_blank(self.client),
            from: non_blank(self.from),
            subject: self.subject.trim().to_string(),
            body,
            body_html,
            is_html: self.is_html,
            to_emails: clean_list(self.to_emails),
            cc_emails: clean_list(self.cc_emails),
        }
    }

    /// Check a normalized request against the configured ceilings.
    ///
    /// # Errors
    /// Returns the first rule the request breaks
    pub fn validate(&self, config: &SpoolConfig) -> std::result::Result<(), ValidationError> {
        if self.to_emails.is_empty() {
            return Err(ValidationError::MissingField("toEmails"));
        }

        if self.subject.trim().is_empty() {
            return Err(ValidationError::MissingField("subject"));
        }

        let text_len = self.body.as_deref().map_or(0, |b| b.trim().chars().count());
        let html_len = self
            .body_html
            .as_deref()
            .map_or(0, |b| b.trim().chars().count());

        if text_len == 0 && html_len == 0 {
            return Err(ValidationError::MissingField("body"));
        }

        if self.subject.chars().count() > config.max_subject_chars {
            return Err(ValidationError::TooLong {
                field: "subject",
                max: config.max_subject_chars,
            });
        }

        if text_len.max(html_len) > config.max_body_chars {
            return Err(ValidationError::TooLong {
                field: "body",
                max: config.max_body_chars,
            });
        }

        if let Some(bad) = self
            .to_emails
            .iter()
            .chain(&self.cc_emails)
            .chain(&self.from)
            .find(|a| !is_plausible_address(a))
        {
            return Err(ValidationError::InvalidAddress(bad.clone()));
        }

        if self
            .request_id
            .as_deref()
            .is_some_and(|id| id.chars().count() > MAX_REQUEST_ID_CHARS)
        {
            return Err(ValidationError::TooLong {
                field: "requestId",
                max: MAX_REQUEST_ID_CHARS,
            });
        }

        Ok(())
    }

    /// The caller-supplied request id, or one derived from the content.
    #[must_use]
    pub fn resolved_request_id(&self) -> String {
        self.request_id
            .clone()
            .unwrap_or_else(|| stable_request_id(self))
    }
}

/// Derive a request id from the content of a request.
///
/// Two submissions with the same recipients (case-insensitive), subject and
/// body collapse to the same id.
#[must_use]
pub fn stable_request_id(request: &EmailRequest) -> String {
    let mut canonical = String::new();
    canonical.push_str(&request.to_emails.join("|").to_lowercase());
    canonical.push('\n');
    canonical.push_str(&request.cc_emails.join("|").to_lowercase());
    canonical.push('\n');
    canonical.push_str(&request.subject);
    canonical.push('\n');
    canonical.push_str(request.body.as_deref().unwrap_or_default());

    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Truncated hash of a request id, used in filenames and idempotency markers.
#[must_use]
pub fn idem_key(request_id: &str) -> String {
    let mut key = hex::encode(Sha256::digest(request_id.as_bytes()));
    key.truncate(IDEM_KEY_LEN);
    key
}

/// Admission metadata stored alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub ip: String,
}

/// A persisted job file.
///
/// Written once at admission and never edited afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub request_id: Option<String>,
    pub received_utc: Option<DateTime<Utc>>,
    pub client: Option<String>,
    pub from: Option<String>,
    pub subject: String,
    pub body: Option<String>,
    pub body_html: Option<String>,
    pub is_html: Option<bool>,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub meta: JobMeta,
}

impl Job {
    /// Build the file content for a normalized request.
    #[must_use]
    pub fn new(request: EmailRequest, received: DateTime<Utc>, source_ip: &str) -> Self {
        Self {
            request_id: request.request_id,
            received_utc: Some(received),
            client: request.client,
            from: request.from,
            subject: request.subject,
            body: request.body,
            body_html: request.body_html,
            is_html: request.is_html,
            to_emails: request.to_emails,
            cc_emails: request.cc_emails,
            meta: JobMeta {
                ip: source_ip.to_string(),
            },
        }
    }

    /// Serialize to the on-disk representation (indented JSON).
    ///
    /// # Errors
    /// Returns an error if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Read a job file.
    ///
    /// Tolerates the current schema and the older variants: PascalCase
    /// names, `to`/`cc` instead of `toEmails`/`ccEmails`, and a single string
    /// where a list is expected. The result is normalized.
    ///
    /// # Errors
    /// `SpoolError::MalformedJob` if the content is not a JSON object
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| SpoolError::malformed(name, e))?;
        let Value::Object(root) = value else {
            return Err(SpoolError::malformed(name, "expected a JSON object"));
        };

        let request = EmailRequest {
            request_id: read_string(&root, &["requestId", "RequestId"]),
            client: read_string(&root, &["client", "Client"]),
            from: read_string(&root, &["from", "From"]),
            subject: read_string(&root, &["subject", "Subject"]).unwrap_or_default(),
            body: read_string(&root, &["body", "Body"]),
            body_html: read_string(&root, &["bodyHtml", "BodyHtml"]),
            is_html: read_bool(&root, &["isHtml", "IsHtml"]),
            to_emails: read_string_list(&root, &["toEmails", "ToEmails", "to", "To"]),
            cc_emails: read_string_list(&root, &["ccEmails", "CcEmails", "cc", "Cc"]),
        }
        .normalize();

        let received_utc = read_string(&root, &["receivedUtc", "ReceivedUtc"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let ip = ["meta", "Meta"]
            .iter()
            .find_map(|n| root.get(*n).and_then(Value::as_object))
            .and_then(|meta| read_string(meta, &["ip", "Ip"]))
            .unwrap_or_default();

        let mut job = Self::new(request, Utc::now(), &ip);
        job.received_utc = received_utc;
        Ok(job)
    }

    /// The payload as a request, e.g. for resubmission.
    #[must_use]
    pub fn to_request(&self) -> EmailRequest {
        EmailRequest {
            request_id: self.request_id.clone(),
            client: self.client.clone(),
            from: self.from.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            body_html: self.body_html.clone(),
            is_html: self.is_html,
            to_emails: self.to_emails.clone(),
            cc_emails: self.cc_emails.clone(),
        }
    }

    /// The stored request id, or the id derived from the content.
    #[must_use]
    pub fn resolved_request_id(&self) -> String {
        self.request_id
            .clone()
            .unwrap_or_else(|| stable_request_id(&self.to_request()))
    }

    /// The HTML part to send, if any.
    #[must_use]
    pub fn html_body(&self) -> Option<&str> {
        self.body_html.as_deref().filter(|b| !b.is_empty())
    }

    /// The plain text part as supplied, if any.
    ///
    /// When the body was HTML in the legacy style it is not plain text.
    #[must_use]
    pub fn text_body(&self) -> Option<&str> {
        if self.is_html == Some(true) && self.body_html == self.body {
            return None;
        }
        self.body.as_deref().filter(|b| !b.is_empty())
    }
}

fn read_string(root: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| root.get(*n))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn read_bool(root: &Map<String, Value>, names: &[&str]) -> Option<bool> {
    names
        .iter()
        .find_map(|n| root.get(*n))
        .and_then(Value::as_bool)
}

fn read_string_list(root: &Map<String, Value>, names: &[&str]) -> Vec<String> {
    match names.iter().find_map(|n| root.get(*n)) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
