use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{AccountCredentials, AuthMechanism};

const CONFIG_FILE_NAME: &str = "config.toml";
const KEYRING_SERVICE: &str = "mailwatch";

/// Knobs shared by every session. Built from the `[options]` table plus
/// `MAILWATCH_*` environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOptions {
    /// Only consider messages newer than this many days (None = everything).
    pub retention_days: Option<u32>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub connection_timeout: Duration,
    pub health_check: bool,
    pub health_check_interval: Duration,
    pub connectivity_test: bool,
    pub connectivity_test_timeout: Duration,
    pub mailbox: String,
    pub max_message_bytes: u64,
    pub sync_item_timeout: Duration,
    pub sync_retry_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            retention_days: None,
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_interval: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            health_check: true,
            health_check_interval: Duration::from_secs(60),
            connectivity_test: false,
            connectivity_test_timeout: Duration::from_secs(3),
            mailbox: "INBOX".to_string(),
            max_message_bytes: 25 * 1024 * 1024,
            sync_item_timeout: Duration::from_secs(30),
            sync_retry_timeout: Duration::from_secs(90),
        }
    }
}

/// One configured account: a stable id plus the credentials a session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub id: String,
    pub enabled: bool,
    pub credentials: AccountCredentials,
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub options: RuntimeOptions,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOptions {
    retention_days: Option<u32>,
    auto_reconnect: Option<bool>,
    max_reconnect_attempts: Option<u32>,
    reconnect_interval_secs: Option<u64>,
    connection_timeout_secs: Option<u64>,
    health_check: Option<bool>,
    health_check_interval_secs: Option<u64>,
    connectivity_test: Option<bool>,
    connectivity_test_timeout_secs: Option<u64>,
    mailbox: Option<String>,
    max_message_bytes: Option<u64>,
    sync_item_timeout_secs: Option<u64>,
    sync_retry_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,
    #[serde(default = "default_true")]
    enabled: bool,
    host: String,
    port: Option<u16>,
    #[serde(default = "default_true")]
    secure: bool,
    address: String,
    secret: Option<String>,
    #[serde(default)]
    auth: AuthMechanism,
    proxy: Option<String>,
    #[serde(default)]
    announce_identity: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    options: RawOptions,
    #[serde(default)]
    accounts: Vec<RawAccount>,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load from an explicit path, `$MAILWATCH_CONFIG`, or the per-user config
    /// directory, in that order. A missing default file yields an empty config.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match env::var("MAILWATCH_CONFIG") {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (default_config_path()?, false),
            },
        };

        if !path.exists() {
            if explicit {
                bail!("config file {} does not exist", path.display());
            }
            debug!(path = %path.display(), "No config file; using defaults");
            let mut options = RuntimeOptions::default();
            apply_env_overrides(&mut options);
        options.validate()?;
            return Ok(Self {
                options,
                accounts: Vec::new(),
            });
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: RawConfig = toml::from_str(raw).context("invalid TOML")?;

        let mut options = parsed.options.into_options();
        apply_env_overrides(&mut options);

        let mut accounts = Vec::with_capacity(parsed.accounts.len());
        for raw in parsed.accounts {
            accounts.push(raw.into_account()?);
        }

        let mut seen = std::collections::HashSet::new();
        for account in &accounts {
            if !seen.insert(account.id.as_str()) {
                bail!("duplicate account id {}", account.id);
            }
        }

        Ok(Self { options, accounts })
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

impl RuntimeOptions {
    /// Zero intervals would spin the loops; zero timeouts fail everything.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("reconnect_interval_secs", self.reconnect_interval),
            ("connection_timeout_secs", self.connection_timeout),
            ("health_check_interval_secs", self.health_check_interval),
            ("connectivity_test_timeout_secs", self.connectivity_test_timeout),
            ("sync_item_timeout_secs", self.sync_item_timeout),
            ("sync_retry_timeout_secs", self.sync_retry_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                bail!("{key} must be greater than zero");
            }
        }
        if self.max_message_bytes == 0 {
            bail!("max_message_bytes must be greater than zero");
        }
        Ok(())
    }
}

impl RawOptions {
    fn into_options(self) -> RuntimeOptions {
        let d = RuntimeOptions::default();
        RuntimeOptions {
            retention_days: self.retention_days.filter(|d| *d > 0),
            auto_reconnect: self.auto_reconnect.unwrap_or(d.auto_reconnect),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(d.max_reconnect_attempts),
            reconnect_interval: secs_or(self.reconnect_interval_secs, d.reconnect_interval),
            connection_timeout: secs_or(self.connection_timeout_secs, d.connection_timeout),
            health_check: self.health_check.unwrap_or(d.health_check),
            health_check_interval: secs_or(
                self.health_check_interval_secs,
                d.health_check_interval,
            ),
            connectivity_test: self.connectivity_test.unwrap_or(d.connectivity_test),
            connectivity_test_timeout: secs_or(
                self.connectivity_test_timeout_secs,
                d.connectivity_test_timeout,
            ),
            mailbox: self.mailbox.unwrap_or(d.mailbox),
            max_message_bytes: self.max_message_bytes.unwrap_or(d.max_message_bytes),
            sync_item_timeout: secs_or(self.sync_item_timeout_secs, d.sync_item_timeout),
            sync_retry_timeout: secs_or(self.sync_retry_timeout_secs, d.sync_retry_timeout),
        }
    }
}

impl RawAccount {
    fn into_account(self) -> Result<AccountConfig> {
        if self.id.trim().is_empty() {
            bail!("account id must not be empty");
        }
        if !self.address.contains('@') {
            bail!("account {}: address {:?} is not an email address", self.id, self.address);
        }
        if let Some(proxy) = &self.proxy {
            url::Url::parse(proxy)
                .with_context(|| format!("account {}: invalid proxy URL", self.id))?;
        }

        let secret = match self.secret {
            Some(s) => s,
            None => lookup_secret(&self.id, &self.address)
                .with_context(|| format!("account {}: no secret configured", self.id))?,
        };
        let port = self.port.unwrap_or(if self.secure { 993 } else { 143 });

        Ok(AccountConfig {
            id: self.id,
            enabled: self.enabled,
            credentials: AccountCredentials {
                host: self.host,
                port,
                secure: self.secure,
                address: self.address,
                secret,
                auth: self.auth,
                proxy: self.proxy,
                announce_identity: self.announce_identity,
            },
        })
    }
}

/// `MAILWATCH_SECRET_<ID>` first, then the OS keyring entry for the address.
fn lookup_secret(id: &str, address: &str) -> Result<String> {
    let var = format!(
        "MAILWATCH_SECRET_{}",
        id.to_ascii_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_")
    );
    if let Ok(secret) = env::var(&var) {
        return Ok(secret);
    }

    let entry = keyring::Entry::new(KEYRING_SERVICE, address)
        .map_err(|e| anyhow::anyhow!("keyring entry error: {e}"))?;
    match entry.get_password() {
        Ok(secret) => Ok(secret),
        Err(keyring::Error::NoEntry) => bail!("set `secret`, ${var}, or a keyring entry"),
        Err(e) => bail!("keyring read: {e}"),
    }
}

fn apply_env_overrides(options: &mut RuntimeOptions) {
    if let Some(days) = env_parse::<u32>("MAILWATCH_RETENTION_DAYS") {
        options.retention_days = Some(days).filter(|d| *d > 0);
    }
    if let Some(v) = env_bool("MAILWATCH_AUTO_RECONNECT") {
        options.auto_reconnect = v;
    }
    if let Some(v) = env_parse("MAILWATCH_MAX_RECONNECT_ATTEMPTS") {
        options.max_reconnect_attempts = v;
    }
    if let Some(v) = env_parse("MAILWATCH_RECONNECT_INTERVAL_SECS") {
        options.reconnect_interval = Duration::from_secs(v);
    }
    if let Some(v) = env_bool("MAILWATCH_HEALTH_CHECK") {
        options.health_check = v;
    }
    if let Some(v) = env_parse("MAILWATCH_HEALTH_CHECK_INTERVAL_SECS") {
        options.health_check_interval = Duration::from_secs(v);
    }
    if let Some(v) = env_bool("MAILWATCH_CONNECTIVITY_TEST") {
        options.connectivity_test = v;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
}

fn secs_or(secs: Option<u64>, default: Duration) -> Duration {
    secs.map(Duration::from_secs).unwrap_or(default)
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("could not determine config directory")?;
    Ok(base.join("mailwatch").join(CONFIG_FILE_NAME))
}
