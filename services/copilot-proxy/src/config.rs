//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Token secrets never appear in the TOML; they live one per file in the
//! tokens directory and are added through the admin API.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use copilot_client::ClientSettings;
use copilot_pool::{ManagerSettings, QuotaTracker};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
}

/// HTTP listener and upstream settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener. Disabled when absent.
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Refuse non-model requests served by a token that reports telemetry.
    #[serde(default = "default_block_telemetry")]
    pub block_telemetry: bool,
}

/// Upstream retry policy
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// How stored secrets become upstream bearer values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Send the stored secret as-is.
    Passthrough,
    /// Trade the GitHub token for a short-lived Copilot token.
    Copilot,
}

/// Token pool settings
#[derive(Debug, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_tokens_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_exchange")]
    pub exchange: ExchangeKind,
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_max_rotation_attempts")]
    pub max_rotation_attempts: u32,
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
    #[serde(default = "default_reset_window")]
    pub default_reset_window_secs: u64,
    #[serde(default = "default_monitored_categories")]
    pub monitored_categories: Vec<String>,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            directory: default_tokens_dir(),
            exchange: default_exchange(),
            token_lifetime_secs: default_token_lifetime(),
            safety_margin_secs: default_safety_margin(),
            max_rotation_attempts: default_max_rotation_attempts(),
            reclaim_interval_secs: default_reclaim_interval(),
            default_reset_window_secs: default_reset_window(),
            monitored_categories: default_monitored_categories(),
        }
    }
}

fn default_upstream_url() -> String {
    copilot_auth::DEFAULT_API_URL.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    1000
}

fn default_block_telemetry() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_tokens_dir() -> PathBuf {
    PathBuf::from("tokens")
}

fn default_exchange() -> ExchangeKind {
    ExchangeKind::Copilot
}

fn default_token_lifetime() -> u64 {
    1800
}

fn default_safety_margin() -> u64 {
    600
}

fn default_max_rotation_attempts() -> u32 {
    100
}

fn default_reclaim_interval() -> u64 {
    60
}

fn default_reset_window() -> u64 {
    3600
}

fn default_monitored_categories() -> Vec<String> {
    vec!["chat".to_string()]
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// `COPILOT_TOKENS_DIR` overrides `tokens.directory`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(dir) = std::env::var("COPILOT_TOKENS_DIR")
            && !dir.trim().is_empty()
        {
            config.tokens.directory = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        let positive = [
            ("timeout_secs", self.proxy.timeout_secs),
            ("max_connections", self.proxy.max_connections as u64),
            ("max_attempts", u64::from(self.retry.max_attempts)),
            ("max_rotation_attempts", u64::from(self.tokens.max_rotation_attempts)),
            ("reclaim_interval_secs", self.tokens.reclaim_interval_secs),
            ("token_lifetime_secs", self.tokens.token_lifetime_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.tokens.safety_margin_secs >= self.tokens.token_lifetime_secs {
            return Err(common::Error::Config(
                "safety_margin_secs must be less than token_lifetime_secs".into(),
            ));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(common::Error::Config(
                "base_delay_ms must not exceed max_delay_ms".into(),
            ));
        }

        if self.tokens.monitored_categories.is_empty() {
            return Err(common::Error::Config(
                "monitored_categories must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("copilot-proxy.toml")
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.proxy.upstream_url.clone(),
            timeout: Duration::from_secs(self.proxy.timeout_secs),
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            block_telemetry: self.proxy.block_telemetry,
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            token_lifetime: Duration::from_secs(self.tokens.token_lifetime_secs),
            safety_margin: Duration::from_secs(self.tokens.safety_margin_secs),
            max_rotation_attempts: self.tokens.max_rotation_attempts,
        }
    }

    pub fn quota_tracker(&self) -> QuotaTracker {
        QuotaTracker::new(
            self.tokens.monitored_categories.clone(),
            Duration::from_secs(self.tokens.default_reset_window_secs),
        )
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.tokens.reclaim_interval_secs)
    }
}
