//! Configuration loading and management.
//!
//! Loads configuration from `./mailspool.toml` (or `$MAILSPOOL_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level mailspool configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SMTP server and sender settings (`[smtp]`).
    pub smtp: SmtpConfig,
    /// Retry policy for the delivery worker (`[delivery]`).
    pub delivery: DeliveryConfig,
    /// Filesystem paths for persistent state (`[paths]`).
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$MAILSPOOL_CONFIG_PATH` or `./mailspool.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config file path using a custom env resolver (for testing).
    fn config_path(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("MAILSPOOL_CONFIG_PATH") {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("mailspool.toml"),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`
    /// in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MAILSPOOL_SMTP_HOST") {
            self.smtp.host = v;
        }
        if let Some(v) = env("MAILSPOOL_SMTP_PORT") {
            match v.parse() {
                Ok(n) => self.smtp.port = n,
                Err(_) => warn_invalid("MAILSPOOL_SMTP_PORT", &v),
            }
        }
        if let Some(v) = env("MAILSPOOL_SMTP_SECURITY") {
            match SecurityMode::parse(&v) {
                Some(mode) => self.smtp.security = mode,
                None => warn_invalid("MAILSPOOL_SMTP_SECURITY", &v),
            }
        }
        if let Some(v) = env("MAILSPOOL_SENDER") {
            self.smtp.sender = v;
        }
        if let Some(v) = env("MAILSPOOL_SMTP_USERNAME") {
            self.smtp.username = Some(v);
        }
        if let Some(v) = env("MAILSPOOL_SMTP_PASSWORD") {
            self.smtp.password = Some(v);
        }
        if let Some(v) = env("MAILSPOOL_MAX_ATTEMPTS") {
            match v.parse() {
                Ok(n) => self.delivery.max_attempts = n,
                Err(_) => warn_invalid("MAILSPOOL_MAX_ATTEMPTS", &v),
            }
        }
        if let Some(v) = env("MAILSPOOL_ERROR_BACKOFF_SECS") {
            match v.parse() {
                Ok(n) => self.delivery.error_backoff_secs = n,
                Err(_) => warn_invalid("MAILSPOOL_ERROR_BACKOFF_SECS", &v),
            }
        }
        if let Some(v) = env("MAILSPOOL_SHUTDOWN_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.delivery.shutdown_timeout_secs = n,
                Err(_) => warn_invalid("MAILSPOOL_SHUTDOWN_TIMEOUT_SECS", &v),
            }
        }
        if let Some(v) = env("MAILSPOOL_LEDGER_PATH") {
            self.paths.ledger_db = v;
        }
        if let Some(v) = env("MAILSPOOL_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
    }
}

fn warn_invalid(var: &str, value: &str) {
    tracing::warn!(var, value, "ignoring invalid env override");
}

// ── Sections ────────────────────────────────────────────────────

/// SMTP server and sender settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connection security mode.
    pub security: SecurityMode,
    /// Envelope sender address.
    pub sender: String,
    /// Username for AUTH; authentication is skipped when unset.
    pub username: Option<String>,
    /// Password for AUTH.
    pub password: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 25,
            security: SecurityMode::None,
            sender: "mailspool@localhost".to_owned(),
            username: None,
            password: None,
        }
    }
}

/// Retry policy for the delivery worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per message before giving up.
    pub max_attempts: u32,
    /// Pause after a failed attempt, in seconds.
    pub error_backoff_secs: u64,
    /// How long shutdown waits for the worker to drain, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl DeliveryConfig {
    /// Backoff as a [`Duration`].
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Shutdown drain deadline as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            error_backoff_secs: 60,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite ledger database file.
    pub ledger_db: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger_db: "mailspool.db".to_owned(),
            logs_dir: "logs".to_owned(),
        }
    }
}

/// Connection security mode for the SMTP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Plain TCP, no TLS.
    None,
    /// STARTTLS upgrade after EHLO. Accepted in configuration but not
    /// implemented by the bundled transport.
    StartTls,
}

impl SecurityMode {
    /// Stable string form, matching the TOML spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityMode::None => "none",
            SecurityMode::StartTls => "start_tls",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(SecurityMode::None),
            "start_tls" => Some(SecurityMode::StartTls),
            _ => None,
        }
    }
}

// ── Live-reloadable settings handle ─────────────────────────────

/// Shared, reloadable view of the configuration.
///
/// The delivery worker takes a [`snapshot`](Settings::snapshot) at the start
/// of each attempt, so a [`replace`](Settings::replace) takes effect at the
/// next attempt without restarting the worker.
#[derive(Debug, Clone)]
pub struct Settings {
    inner: Arc<RwLock<Config>>,
}

impl Settings {
    /// Wrap an initial configuration.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone the current configuration.
    pub fn snapshot(&self) -> Config {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install a reloaded configuration.
    pub fn replace(&self, config: Config) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}
