//! Outbound transport seam.
//!
//! The delivery worker talks to the outside world only through the
//! [`Transport`] trait: connect, optionally authenticate, send one message,
//! disconnect. One connection per attempt; the worker never reuses a
//! connection across attempts, so there is no stale-connection handling.
//! Tests substitute a scripted implementation.

pub mod smtp;

use async_trait::async_trait;

use crate::config::SecurityMode;
use crate::ledger::Message;

pub use smtp::SmtpTransport;

/// Errors from the transport layer.
///
/// These never escape the delivery worker; they feed the
/// retry/backoff/give-up policy.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// TCP connection could not be established.
    #[error("connection to {host}:{port} failed: {reason}")]
    Connect {
        /// Server host.
        host: String,
        /// Server port.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// The server replied with an unexpected status code.
    #[error("server rejected {command}: {reply}")]
    Rejected {
        /// Command that was refused.
        command: String,
        /// Full server reply line.
        reply: String,
    },

    /// Authentication was refused.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Socket read/write failure mid-session.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured security mode is not implemented.
    #[error("unsupported security mode: {0}")]
    UnsupportedSecurity(String),

    /// A method was called out of session order.
    #[error("transport not connected")]
    NotConnected,
}

/// One outbound connection lifecycle.
///
/// Call order per attempt: [`connect`](Transport::connect), then optionally
/// [`authenticate`](Transport::authenticate), then
/// [`send`](Transport::send), then [`disconnect`](Transport::disconnect).
#[async_trait]
pub trait Transport: Send {
    /// Open a connection and complete the protocol greeting.
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        security: SecurityMode,
    ) -> Result<(), TransportError>;

    /// Authenticate the session. Only called when credentials are
    /// configured.
    async fn authenticate(&mut self, username: &str, password: &str)
        -> Result<(), TransportError>;

    /// Transmit one message from `sender` to the message's recipient.
    async fn send(&mut self, sender: &str, message: &Message) -> Result<(), TransportError>;

    /// Close the session. Best-effort; errors here still count as a failed
    /// attempt if the payload was not yet acknowledged.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
