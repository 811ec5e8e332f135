//! Minimal SMTP client: one plain TCP connection, one transaction.

use std::time::Duration;

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use super::response::Response;

/// Upper bound on the lines of a single reply, e.g. a long EHLO list.
const MAX_RESPONSE_LINES: usize = 128;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    /// The stage that timed out.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("SMTP error {code}: {message}")]
    SmtpError { code: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug)]
pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl SmtpClient {
    /// Connect to `addr` (`host:port`).
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established in time
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(format!("connection to {addr}")))??;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            timeout,
        })
    }

    /// Reads the server greeting, which must be a 2xx reply.
    ///
    /// # Errors
    /// Returns an error if reading fails or the greeting is a rejection
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await?.expect(220)
    }

    async fn write(&mut self, data: &[u8], stage: &str) -> Result<()> {
        tokio::time::timeout(self.timeout, async {
            self.writer.write_all(data).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout(stage.to_string()))??;
        Ok(())
    }

    /// Sends a raw command and reads the reply.
    ///
    /// # Errors
    /// Returns an error if sending or reading fails
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.write(format!("{command}\r\n").as_bytes(), command)
            .await?;
        self.read_response().await
    }

    /// Sends EHLO, falling back to HELO for servers that reject it.
    ///
    /// # Errors
    /// Returns an error if both are rejected
    pub async fn hello(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        if response.is_success() {
            return Ok(response);
        }

        self.command(&format!("HELO {domain}")).await?.expect(250)
    }

    /// # Errors
    /// Returns an error unless the server accepts the sender
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>"))
            .await?
            .expect(250)
    }

    /// # Errors
    /// Returns an error unless the server accepts the recipient
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await?.expect(250)
    }

    /// Sends DATA, the dot-stuffed message and the terminating dot.
    ///
    /// # Errors
    /// Returns an error unless the server accepts the message
    pub async fn data(&mut self, message: &str) -> Result<Response> {
        self.command("DATA").await?.expect(354)?;

        self.write(dot_stuff(message).as_bytes(), "message content")
            .await?;

        self.read_response().await?.expect(250)
    }

    /// # Errors
    /// Returns an error if the connection fails before the reply
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Reads a complete reply, bounded by the client timeout per line.
    ///
    /// # Errors
    /// Returns an error if reading fails, the connection closes or the reply
    /// is malformed
    pub async fn read_response(&mut self) -> Result<Response> {
        let mut lines = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| ClientError::Timeout("server reply".to_string()))??;

            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }

            let parsed = Response::parse_line(line.trim_end_matches(['\r', '\n']))?;
            lines.push(parsed.message);

            if parsed.is_last {
                return Ok(Response::new(parsed.code, lines));
            }

            if lines.len() >= MAX_RESPONSE_LINES {
                return Err(ClientError::ParseError(format!(
                    "Reply exceeds {MAX_RESPONSE_LINES} lines"
                )));
            }
        }
    }
}

/// Normalise line endings to CRLF, double leading dots and append the
/// end-of-data marker.
pub(crate) fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len() + 5);

    for line in message.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out.push_str(".\r\n");
    out
}
