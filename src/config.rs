use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000";
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// STUN/TURN urls handed to the ICE agent as-is.
    #[serde(default)]
    pub ice_servers: Vec<String>,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub include_loopback_candidates: bool,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// CLI flags that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub username: Option<String>,
    pub relay_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            relay_url: default_relay_url(),
            ice_servers: Vec::new(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            include_loopback_candidates: false,
            config_path: None,
        }
    }
}

impl Config {
    pub fn load_with_overrides(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                let mut cfg: Config =
                    serde_json::from_str(&data).context("parse config json")?;
                cfg.config_path = Some(path.to_path_buf());
                cfg
            }
            None => Config::default(),
        };
        cfg.apply(overrides);
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(username) = overrides.username {
            self.username = username;
        }
        if let Some(relay_url) = overrides.relay_url {
            self.relay_url = relay_url;
        }
    }

    fn normalize(&mut self) {
        self.username = self.username.trim().to_string();
        self.relay_url = self.relay_url.trim().to_string();
    }

    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username).context("username")?;
        validate_relay_url(&self.relay_url).context("relay_url")?;
        if self.grace_period_ms == 0 {
            anyhow::bail!("grace_period_ms must be positive");
        }
        Ok(())
    }
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD_MS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

pub fn validate_relay_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        anyhow::bail!("url must be ws or wss");
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[^\p{Cc}]{1,64}$").unwrap());
    if PATTERN.is_match(username) {
        Ok(())
    } else {
        anyhow::bail!("invalid username: {username:?}")
    }
}
