use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Daemon-wide defaults; per-job values in the jobconfig table override them.
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_SECS: u64 = 30; // monitor tick cadence
pub const DEFAULT_COOLDOWN_SECS: u64 = 3600; // alert dedup window
pub const DEFAULT_GRACE_SECS: u64 = 120; // START lateness allowance
pub const DEFAULT_TIMEOUT_SECS: u64 = 300; // max runtime without FINISH
pub const DEFAULT_LOOKBACK_SECS: u64 = 3600; // fire re-examination window
pub const REQUEST_TIMEOUT_SECS: u64 = 30; // client API + wrapper HTTP
pub const NOTIFY_FLUSH_SECS: u64 = 30; // shutdown flush budget

/// Top-level config (crab.toml + CRAB_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrabConfig {
    #[serde(default)]
    pub crab: CrabSection,
    pub store: StoreSection,
    #[serde(default)]
    pub outputstore: Option<OutputStoreSection>,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub crabsh: CrabshSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrabSection {
    /// Working directory for the daemon (PID file, static assets).
    #[serde(default = "default_home")]
    pub home: String,
    /// Absolute URL the daemon is served under. Setting it enables the
    /// syndication feed, whose links need to be absolute.
    pub base_url: Option<String>,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for CrabSection {
    fn default() -> Self {
        Self {
            home: default_home(),
            base_url: None,
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Path to the SQLite database file.
    pub path: String,
    /// Event retention in days. Absent means events are kept forever.
    pub retention_days: Option<u32>,
}

/// Optional secondary backend for large stdout/stderr blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputStoreSection {
    #[serde(default = "default_output_backend")]
    pub backend: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    /// Default IANA zone for schedules that do not carry their own.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Monitor tick seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Default dedup window seconds for rules without an explicit one.
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            interval: default_interval(),
            cooldown: default_cooldown(),
        }
    }
}

/// Per-transport option tables (`[transport.email]`, `[transport.command]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSection {
    pub email: Option<EmailTransportConfig>,
    pub command: Option<CommandTransportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTransportConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Sender address for alert mail.
    pub from: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTransportConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Wrapper-side options, read by `crabsh` from the same file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrabshSection {
    /// Honour `{inhibit: true}` start responses by skipping the run.
    #[serde(default)]
    pub allow_inhibit: bool,
}

fn default_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.crab")
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_interval() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECS
}
fn default_smtp_port() -> u16 {
    587
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_output_backend() -> String {
    "sqlite".to_string()
}

impl CrabConfig {
    /// Load config from a TOML file with CRAB_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. CRAB_CONFIG environment variable
    ///   3. ~/.crab/crab.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CRAB_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: CrabConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRAB_").split("_"))
            .extract()
            .map_err(|e| crate::error::CrabError::Config(e.to_string()))?;

        Ok(config)
    }

    /// The base URL the daemon should report in feed links, if configured.
    /// Trailing slashes are stripped so joins are predictable.
    pub fn base_url(&self) -> Option<String> {
        self.crab
            .base_url
            .as_ref()
            .map(|u| u.trim_end_matches('/').to_string())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.crab/crab.toml")
}
