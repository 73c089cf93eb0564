//! Configuration system for refunc.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $REFUNC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/refunc/config.toml
//!   3. ~/.config/refunc/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RefuncConfig {
    /// Functions served by the local worker agent.
    pub functions: Vec<FunctionConfig>,
    pub client: ClientConfig,
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Router base URL for the long-poll transport. Empty = bus only.
    pub base_url: String,
    /// Ask for log frames by default.
    pub recv_log: bool,
    pub retry: RetryConfig,
}

/// Long-poll reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// How long a cancelled poll waits for its connection to close.
    pub close_timeout_ms: u64,
    /// Hard ceiling on one invocation, whatever its deadline.
    pub max_invocation_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Namespace to serve. Empty = all namespaces.
    pub namespace: String,
    pub poke_interval_ms: u64,
    pub status_poll_ms: u64,
    /// Extra time granted on top of a function's timeout to cover a cold start.
    pub launch_bias_secs: u64,
    /// Forwards slower than this are logged at warn.
    pub slow_forward_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub namespace: String,
    pub name: String,
    /// Worker executable speaking the line protocol on stdin/stdout.
    pub command: String,
    pub args: Vec<String>,
    /// 0 = platform default.
    pub timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            recv_log: false,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 17,
            initial_delay_ms: 2,
            max_delay_ms: 3_000,
            close_timeout_ms: 3_000,
            max_invocation_secs: 4 * 60 * 60,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            poke_interval_ms: 47,
            status_poll_ms: 500,
            launch_bias_secs: 10,
            slow_forward_ms: 200,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { port: 7788 }
    }
}

impl BrokerConfig {
    pub fn poke_interval(&self) -> Duration {
        Duration::from_millis(self.poke_interval_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn launch_bias(&self) -> Duration {
        Duration::from_secs(self.launch_bias_secs)
    }

    pub fn slow_forward(&self) -> Duration {
        Duration::from_millis(self.slow_forward_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("refunc")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RefuncConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            RefuncConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("REFUNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RefuncConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply REFUNC_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REFUNC_ROUTER_BASE") {
            self.client.base_url = v;
        }
        if let Ok(v) = std::env::var("REFUNC_NAMESPACE") {
            self.broker.namespace = v;
        }
        if let Ok(v) = std::env::var("REFUNC_GATEWAY__PORT") {
            if let Ok(p) = v.parse() {
                self.gateway.port = p;
            }
        }
        if let Ok(v) = std::env::var("REFUNC_CLIENT__RECV_LOG") {
            self.client.recv_log = v == "true" || v == "1";
        }
    }
}
