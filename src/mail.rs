//! Outbound mail transports.

use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info};

/// A fully composed message, template already applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// HTML body.
    pub body: String,
}

#[derive(Debug)]
pub enum MailError {
    Io(io::Error),
    /// The server answered with an unexpected reply code.
    Rejected { code: u16, line: String },
    Protocol(String),
}

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailError::Io(e) => write!(f, "mail I/O error: {e}"),
            MailError::Rejected { code, line } => write!(f, "mail rejected ({code}): {line}"),
            MailError::Protocol(msg) => write!(f, "mail protocol error: {msg}"),
        }
    }
}

impl std::error::Error for MailError {}

impl From<io::Error> for MailError {
    fn from(e: io::Error) -> Self {
        MailError::Io(e)
    }
}

impl From<LinesCodecError> for MailError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => MailError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                MailError::Protocol("reply line too long".into())
            }
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), MailError>;

    fn name(&self) -> &'static str;
}

// ── SMTP ─────────────────────────────────────────────────

const MAX_REPLY_LINE: usize = 4096;

/// Plain SMTP, one connection per message, no auth or TLS. Meant for a local relay or
/// a development mail catcher.
pub struct SmtpTransport {
    host: String,
    port: u16,
    helo_name: String,
}

impl SmtpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            helo_name: "localhost".into(),
        }
    }
}

struct SmtpConn {
    framed: Framed<TcpStream, LinesCodec>,
}

impl SmtpConn {
    /// Read a possibly multi-line reply (`250-...` continues, `250 ...` ends).
    async fn reply(&mut self) -> Result<(u16, String), MailError> {
        loop {
            let line = self
                .framed
                .next()
                .await
                .ok_or_else(|| MailError::Protocol("connection closed".into()))??;
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| MailError::Protocol(format!("bad reply: {line}")))?;
            if line.as_bytes().get(3) == Some(&b'-') {
                continue;
            }
            return Ok((code, line));
        }
    }

    async fn expect(&mut self, accepted: &[u16]) -> Result<(), MailError> {
        let (code, line) = self.reply().await?;
        if accepted.contains(&code) {
            Ok(())
        } else {
            Err(MailError::Rejected { code, line })
        }
    }

    /// LinesCodec terminates with `\n`; the `\r` makes it CRLF.
    async fn line(&mut self, line: &str) -> Result<(), MailError> {
        self.framed.send(format!("{line}\r")).await?;
        Ok(())
    }

    async fn command(&mut self, line: &str, accepted: &[u16]) -> Result<(), MailError> {
        self.line(line).await?;
        self.expect(accepted).await
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), MailError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let mut conn = SmtpConn {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_REPLY_LINE)),
        };

        conn.expect(&[220]).await?;
        conn.line(&format!("EHLO {}", self.helo_name)).await?;
        if conn.expect(&[250]).await.is_err() {
            conn.command(&format!("HELO {}", self.helo_name), &[250])
                .await?;
        }
        conn.command(&format!("MAIL FROM:<{}>", message.from), &[250])
            .await?;
        conn.command(&format!("RCPT TO:<{}>", message.to), &[250, 251])
            .await?;
        conn.command("DATA", &[354]).await?;

        conn.line(&format!("From: {}", message.from)).await?;
        conn.line(&format!("To: {}", message.to)).await?;
        conn.line(&format!("Subject: {}", message.subject)).await?;
        conn.line(&format!("Date: {}", chrono::Utc::now().to_rfc2822()))
            .await?;
        conn.line("MIME-Version: 1.0").await?;
        conn.line("Content-Type: text/html; charset=\"utf-8\"").await?;
        conn.line("").await?;
        for body_line in message.body.lines() {
            // Dot-stuffing.
            if body_line.starts_with('.') {
                conn.line(&format!(".{body_line}")).await?;
            } else {
                conn.line(body_line).await?;
            }
        }
        conn.command(".", &[250]).await?;

        // The message is accepted at this point; a failed QUIT does not matter.
        if let Err(e) = conn.command("QUIT", &[221]).await {
            debug!("SMTP QUIT: {e}");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

// ── Outbox file ──────────────────────────────────────────

/// Appends each message as one JSON line.
pub struct OutboxTransport {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl OutboxTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl MailTransport for OutboxTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), MailError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| MailError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "outbox"
    }
}

// ── Log only ─────────────────────────────────────────────

pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), MailError> {
        info!(
            from = %message.from,
            to = %message.to,
            subject = %message.subject,
            bytes = message.body.len(),
            "mail (log transport)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

// ── In-memory (tests) ────────────────────────────────────
