//! TimeLoop configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TimeLoopError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeLoopConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl TimeLoopConfig {
    /// Load config from the default path (~/.timeloop/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TimeLoopError::Config(format!("Failed to read config: {e}")))?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TimeLoopError::Config(format!("Failed to parse config: {e}")))
    }

    /// Write config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TimeLoopError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TimeLoop home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".timeloop")
    }

    /// `JWT_SECRET` takes precedence over the file.
    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("JWT_SECRET")
            && !secret.is_empty()
        {
            self.server.jwt_secret = secret;
        }
    }

    /// Reject values that would stall or spin the sweeper.
    pub fn validate(&self) -> Result<()> {
        if self.sweeper.interval_secs == 0 {
            return Err(TimeLoopError::InvalidConfig {
                field: "sweeper.interval_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.sweeper.page_size == 0 {
            return Err(TimeLoopError::InvalidConfig {
                field: "sweeper.page_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.sweeper.max_pages == 0 {
            return Err(TimeLoopError::InvalidConfig {
                field: "sweeper.max_pages",
                reason: "must be greater than zero".into(),
            });
        }
        if self.sweeper.max_concurrent_dispatches == 0 {
            return Err(TimeLoopError::InvalidConfig {
                field: "sweeper.max_concurrent_dispatches",
                reason: "must be greater than zero".into(),
            });
        }
        if self.delivery.max_attempts == 0 {
            return Err(TimeLoopError::InvalidConfig {
                field: "delivery.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        if self.delivery.interval_secs == 0 {
            return Err(TimeLoopError::InvalidConfig {
                field: "delivery.interval_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.push.enabled && self.push.endpoint.is_empty() {
            return Err(TimeLoopError::InvalidConfig {
                field: "push.endpoint",
                reason: "required when push is enabled".into(),
            });
        }
        if self.webhook.enabled && self.webhook.url.is_empty() {
            return Err(TimeLoopError::InvalidConfig {
                field: "webhook.url",
                reason: "required when webhook is enabled".into(),
            });
        }
        Ok(())
    }
}

fn bool_true() -> bool { true }

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
    /// Allowed CORS origins. Empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

pub const DEFAULT_JWT_SECRET: &str = "timeloop-dev-secret";

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3000 }
fn default_jwt_secret() -> String { DEFAULT_JWT_SECRET.into() }
fn default_token_ttl_hours() -> u64 { 24 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            jwt_secret: default_jwt_secret(),
            token_ttl_hours: default_token_ttl_hours(),
            cors_origins: Vec::new(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.timeloop/timeloop.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded. `:memory:` is passed through.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Unlock sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Seconds between sweep ticks. The old cron job ran hourly.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Candidates fetched per store round-trip.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Upper bound on pages processed in one sweep.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    /// How long a claim may sit in `unlocking` before another sweep recovers it.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    /// Identifies this sweeper in claim bookkeeping. Generated when empty.
    #[serde(default)]
    pub instance_id: String,
}

fn default_sweep_interval() -> u64 { 3600 }
fn default_page_size() -> usize { 100 }
fn default_max_pages() -> usize { 50 }
fn default_dispatch_timeout() -> u64 { 5 }
fn default_max_concurrent_dispatches() -> usize { 8 }
fn default_claim_lease() -> u64 { 600 }

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            claim_lease_secs: default_claim_lease(),
            instance_id: String::new(),
        }
    }
}

/// Retry queue / redelivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Seconds between redelivery passes.
    #[serde(default = "default_delivery_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_backoff() -> u64 { 30 }
fn default_max_backoff() -> u64 { 3600 }
fn default_delivery_interval() -> u64 { 60 }
fn default_batch_size() -> usize { 50 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            interval_secs: default_delivery_interval(),
            batch_size: default_batch_size(),
        }
    }
}

/// Push gateway configuration (device notifications).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HTTP endpoint accepting `{token, notification, data}` messages.
    #[serde(default)]
    pub endpoint: String,
    /// Sent as a bearer token.
    #[serde(default)]
    pub server_key: String,
}

/// Outbound webhook configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}
