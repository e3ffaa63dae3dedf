//! Minimal SMTP client over a plain TCP stream.
//!
//! Implements just enough of the protocol for the delivery worker: greeting,
//! EHLO, AUTH LOGIN, MAIL FROM / RCPT TO / DATA with dot-stuffing, QUIT.
//! TLS is not implemented; only [`SecurityMode::None`] is accepted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::trace;

use super::{Transport, TransportError};
use crate::config::SecurityMode;
use crate::ledger::Message;

/// SMTP implementation of [`Transport`].
///
/// Holds at most one open session. `connect` replaces any previous session.
pub struct SmtpTransport {
    client_name: String,
    stream: Option<BufStream<TcpStream>>,
}

impl SmtpTransport {
    /// Build a transport that identifies itself as `client_name` in EHLO.
    pub fn new(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_owned(),
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut BufStream<TcpStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one (possibly multiline) server reply and return its code and
    /// final line.
    async fn read_reply(&mut self) -> Result<(u16, String), TransportError> {
        let stream = self.stream()?;
        loop {
            let mut line = String::new();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
            let trimmed = line.trim_end().to_owned();
            trace!(reply = %trimmed, "smtp <-");

            // Continuation lines use "NNN-"; the final line uses "NNN ".
            if line.as_bytes().get(3) == Some(&b'-') {
                continue;
            }

            let code = trimmed.get(..3).and_then(|c| c.parse::<u16>().ok());
            return match code {
                Some(code) => Ok((code, trimmed)),
                None => Err(TransportError::Rejected {
                    command: "reply parse".to_owned(),
                    reply: trimmed,
                }),
            };
        }
    }

    async fn expect(&mut self, code: u16, command: &str) -> Result<String, TransportError> {
        let (got, reply) = self.read_reply().await?;
        if got != code {
            return Err(TransportError::Rejected {
                command: command.to_owned(),
                reply,
            });
        }
        Ok(reply)
    }

    async fn command(&mut self, line: &str, code: u16, label: &str) -> Result<(), TransportError> {
        trace!(command = line, "smtp ->");
        self.write_line(line).await?;
        self.expect(code, label).await?;
        Ok(())
    }
}

/// Render the RFC 5322 payload: minimal headers, blank line, dot-stuffed
/// body with CRLF line endings. Always ends with CRLF.
fn format_payload(sender: &str, message: &Message) -> String {
    let date = chrono::Utc::now().to_rfc2822();
    let mut out = format!(
        "From: {sender}\r\nTo: {}\r\nSubject: {}\r\nDate: {date}\r\n\r\n",
        message.recipient, message.subject
    );
    for line in message.body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Remap a rejected reply during the AUTH exchange to an auth error.
fn as_auth_error(e: TransportError) -> TransportError {
    match e {
        TransportError::Rejected { reply, .. } => TransportError::Auth(reply),
        other => other,
    }
}

#[async_trait::async_trait]
impl Transport for SmtpTransport {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        security: SecurityMode,
    ) -> Result<(), TransportError> {
        if security != SecurityMode::None {
            return Err(TransportError::UnsupportedSecurity(
                security.as_str().to_owned(),
            ));
        }

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect {
                host: host.to_owned(),
                port,
                reason: e.to_string(),
            })?;
        self.stream = Some(BufStream::new(tcp));

        self.expect(220, "greeting").await?;
        let ehlo = format!("EHLO {}", self.client_name);
        self.command(&ehlo, 250, "EHLO").await?;
        Ok(())
    }

    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), TransportError> {
        self.command("AUTH LOGIN", 334, "AUTH LOGIN")
            .await
            .map_err(as_auth_error)?;
        // Credentials are written directly, bypassing the command trace.
        self.write_line(&BASE64.encode(username)).await?;
        self.expect(334, "AUTH username")
            .await
            .map_err(as_auth_error)?;
        self.write_line(&BASE64.encode(password)).await?;
        self.expect(235, "AUTH password")
            .await
            .map_err(as_auth_error)?;
        Ok(())
    }

    async fn send(&mut self, sender: &str, message: &Message) -> Result<(), TransportError> {
        let mail_from = format!("MAIL FROM:<{sender}>");
        self.command(&mail_from, 250, "MAIL FROM").await?;
        let rcpt_to = format!("RCPT TO:<{}>", message.recipient);
        self.command(&rcpt_to, 250, "RCPT TO").await?;
        self.command("DATA", 354, "DATA").await?;

        let payload = format_payload(sender, message);
        let stream = self.stream()?;
        stream.write_all(payload.as_bytes()).await?;
        stream.write_all(b".\r\n").await?;
        stream.flush().await?;

        self.expect(250, "message data").await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_none() {
            return Ok(());
        }
        // The connection is dropped whether or not QUIT is acknowledged.
        let result = self.command("QUIT", 221, "QUIT").await;
        self.stream = None;
        result
    }
}
