//! Mailspool — a durable outbound mail delivery queue.
//!
//! Producers submit messages through [`spool::Spool`]; a single background
//! worker drains the queue and transmits each message over SMTP. Every
//! lifecycle transition is recorded in a SQLite ledger so delivery survives
//! process restarts. Delivery is at-least-once: a crash between a completed
//! transmission and the matching ledger update may re-send a message.
//!
//! See `DESIGN.md` for the architecture rationale.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod ledger;
pub mod logging;
pub mod spool;
pub mod transport;
