//! RFC 5322 message rendering.
//!
//! Bodies are always UTF-8 and base64 encoded, so no body line can start with
//! a dot or exceed the SMTP line limit. Messages with an HTML part are sent as
//! `multipart/alternative` with a plain text fallback.

use std::fmt::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};

use crate::transport::OutgoingMail;

const LINE_LENGTH: usize = 76;
const CRLF: &str = "\r\n";

/// Longest chunk of subject bytes put into one RFC 2047 encoded word, so that
/// the encoded word stays under 75 characters.
const ENCODED_WORD_BYTES: usize = 45;

/// Header values never contain line breaks.
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// Encode a subject as RFC 2047 encoded words when it is not plain ASCII.
#[must_use]
pub fn encode_subject(subject: &str) -> String {
    let subject = header_value(subject);
    if subject.is_ascii() {
        return subject;
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in subject.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(&chunk)));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(&chunk)));
    }

    words.join("\r\n ")
}

fn base64_body(body: &str) -> String {
    let encoded = STANDARD.encode(body.as_bytes());
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH * 2 + 2);

    // base64 output is ASCII, so byte chunks are valid UTF-8
    for line in encoded.as_bytes().chunks(LINE_LENGTH) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push_str(CRLF);
    }
    out
}

fn write_part(out: &mut String, content_type: &str, body: &str) {
    let _ = write!(out, "Content-Type: {content_type}; charset=utf-8{CRLF}");
    let _ = write!(out, "Content-Transfer-Encoding: base64{CRLF}{CRLF}");
    out.push_str(&base64_body(body));
}

/// Render `mail` as a complete message sent by `from`.
#[must_use]
pub fn render(mail: &OutgoingMail, from: &str, date: DateTime<Utc>, message_id: &str) -> String {
    let mut out = String::new();

    let _ = write!(out, "From: {}{CRLF}", header_value(from));
    let _ = write!(out, "To: {}{CRLF}", header_value(&mail.to.join(", ")));
    if !mail.cc.is_empty() {
        let _ = write!(out, "Cc: {}{CRLF}", header_value(&mail.cc.join(", ")));
    }
    let _ = write!(out, "Subject: {}{CRLF}", encode_subject(&mail.subject));
    let _ = write!(out, "Date: {}{CRLF}", date.to_rfc2822());
    let _ = write!(out, "Message-ID: {message_id}{CRLF}");
    let _ = write!(out, "MIME-Version: 1.0{CRLF}");

    match mail.html_body.as_deref() {
        Some(html) => {
            let text = mail
                .text_body
                .clone()
                .unwrap_or_else(|| html_to_plain(html));
            let boundary = format!("=_part_{}", ulid::Ulid::new());

            let _ = write!(
                out,
                "Content-Type: multipart/alternative; boundary=\"{boundary}\"{CRLF}{CRLF}"
            );
            let _ = write!(out, "--{boundary}{CRLF}");
            write_part(&mut out, "text/plain", &text);
            let _ = write!(out, "--{boundary}{CRLF}");
            write_part(&mut out, "text/html", html);
            let _ = write!(out, "--{boundary}--{CRLF}");
        }
        None => {
            write_part(
                &mut out,
                "text/plain",
                mail.text_body.as_deref().unwrap_or_default(),
            );
        }
    }

    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = entity.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        let decoded = rest[1..]
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&rest[1..=end]).map(|c| (c, end + 2)));

        match decoded {
            Some((c, consumed)) => {
                out.push(c);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// What a tag turns into in the plain text rendering.
fn tag_replacement(tag: &str) -> &'static str {
    let closing = tag.starts_with('/');
    let name: String = tag
        .trim_start_matches('/')
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();

    match (closing, name.as_str()) {
        (_, "br") => "\n",
        (true, "p") => "\n\n",
        (true, "div" | "tr" | "li" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6") => "\n",
        (true, "td" | "th") => " ",
        _ => "",
    }
}

/// Derive a readable plain text version of an HTML body.
///
/// Line breaks follow block elements, other tags are dropped, `<style>` and
/// `<script>` content is skipped, entities are decoded and every line is
/// trimmed.
#[must_use]
pub fn html_to_plain(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    let mut skip_until: Option<&str> = None;

    while let Some(open) = rest.find('<') {
        if skip_until.is_none() {
            text.push_str(&rest[..open]);
        }

        let Some(close) = rest[open..].find('>') else {
            // Unterminated tag: keep the rest as text
            if skip_until.is_none() {
                text.push_str(&rest[open..]);
            }
            rest = "";
            break;
        };

        let tag = &rest[open + 1..open + close];
        let lower = tag.to_ascii_lowercase();
        rest = &rest[open + close + 1..];

        if let Some(end) = skip_until {
            if lower.starts_with(end) {
                skip_until = None;
            }
            continue;
        }

        if lower.starts_with("style") {
            skip_until = Some("/style");
        } else if lower.starts_with("script") {
            skip_until = Some("/script");
        } else {
            text.push_str(tag_replacement(tag));
        }
    }

    if skip_until.is_none() {
        text.push_str(rest);
    }

    let decoded = decode_entities(&text.replace("\r\n", "\n"));
    let lines: Vec<&str> = decoded
        .lines()
        .map(str::trim)
        .collect();

    lines.join("\n").trim().to_string()
}
