//! Mailspool CLI entry point.
//!
//! Provides `start` (the delivery daemon with graceful shutdown), `submit`
//! (insert a message into the ledger for pickup at the next start), and
//! `pending` (list unresolved messages).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mailspool::config::{Config, Settings};
use mailspool::ledger::{Ledger, Message};
use mailspool::spool::Spool;
use mailspool::transport::SmtpTransport;

/// Mailspool — durable outbound mail delivery queue.
#[derive(Parser)]
#[command(name = "mailspool", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the delivery daemon.
    Start,
    /// Record a message in the ledger; the daemon delivers it during its
    /// next recovery pass.
    Submit {
        /// Destination address.
        recipient: String,
        /// Subject line.
        subject: String,
        /// Message body.
        body: String,
    },
    /// List messages whose delivery is not yet resolved.
    Pending,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Submit {
            recipient,
            subject,
            body,
        } => handle_submit(&recipient, &subject, &body).await,
        Command::Pending => handle_pending().await,
    }
}

/// Run the delivery daemon until SIGINT/SIGTERM.
async fn handle_start() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _logging_guard = mailspool::logging::init_daemon(Path::new(&config.paths.logs_dir))?;

    info!(version = env!("CARGO_PKG_VERSION"), "mailspool starting");

    let ledger = Arc::new(Ledger::open(Path::new(&config.paths.ledger_db)).await?);
    info!(path = %config.paths.ledger_db, "ledger opened");

    let shutdown_timeout = config.delivery.shutdown_timeout();
    let settings = Settings::new(config);
    let spool = Spool::new(ledger, settings);

    let transport = SmtpTransport::new("mailspool");
    spool
        .start(Box::new(transport))
        .await
        .context("failed to start delivery service")?;

    wait_for_shutdown_signal().await;

    info!("initiating graceful shutdown");
    if !spool.stop(shutdown_timeout).await {
        warn!("in-flight delivery abandoned; it will be recovered at next start");
    }

    info!("mailspool stopped");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Insert a delivery record directly; picked up by recovery at next start.
async fn handle_submit(recipient: &str, subject: &str, body: &str) -> anyhow::Result<()> {
    mailspool::logging::init_cli();

    let config = Config::load().context("failed to load configuration")?;
    let ledger = Ledger::open(Path::new(&config.paths.ledger_db)).await?;

    let message = Message::new(recipient, subject, body);
    ledger.insert_message(&message).await?;

    println!("{}", message.id);
    Ok(())
}

/// Print every unresolved message, one per line.
async fn handle_pending() -> anyhow::Result<()> {
    mailspool::logging::init_cli();

    let config = Config::load().context("failed to load configuration")?;
    let ledger = Ledger::open(Path::new(&config.paths.ledger_db)).await?;

    let pending = ledger.pending_messages().await?;
    for message in &pending {
        let attempts = ledger.attempt_count(message.id).await.unwrap_or(0);
        println!(
            "{}  attempts={}  to={}  subject={}",
            message.id, attempts, message.recipient, message.subject
        );
    }
    println!("{} pending", pending.len());
    Ok(())
}
