use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// WebSocket endpoint of the Continuum server.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Default window for a correlated request.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Window for chat-style round trips, which the server answers slowly.
    #[serde(default = "default_chat_timeout_ms")]
    pub chat_timeout_ms: u64,
    /// Frame types the server sends unsolicited right after the upgrade, in order.
    #[serde(default = "default_greeting_frames")]
    pub greeting_frames: Vec<String>,
    /// Frame types that are expected on the discard path and logged only at trace level.
    #[serde(default = "default_discard_types")]
    pub discard_types: Vec<String>,
    /// Capacity of each broadcast subscription channel.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

fn default_url() -> String {
    "ws://localhost:9000".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_chat_timeout_ms() -> u64 {
    30_000
}

fn default_greeting_frames() -> Vec<String> {
    vec!["status".to_string(), "connection_banner".to_string()]
}

fn default_discard_types() -> Vec<String> {
    vec![
        "status".to_string(),
        "connection_banner".to_string(),
        "working".to_string(),
    ]
}

fn default_subscription_buffer() -> usize {
    64
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            chat_timeout_ms: default_chat_timeout_ms(),
            greeting_frames: default_greeting_frames(),
            discard_types: default_discard_types(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl BridgeConfig {
    /// Default configuration pointed at another endpoint.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_millis(self.chat_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// `~/.continuum/config.json`, relative to the working directory when
    /// there is no home directory.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".continuum")
            .join("config.json")
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from [`Config::default_path`], apply env overrides and validate.
    pub fn discover() -> Result<Self> {
        let mut config = Self::load_or_default(&Self::default_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `CONTINUUM_WS_URL` and `CONTINUUM_LOG` on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CONTINUUM_WS_URL") {
            let url = url.trim();
            if !url.is_empty() {
                self.bridge.url = url.to_string();
            }
        }
        if let Ok(level) = std::env::var("CONTINUUM_LOG") {
            let level = level.trim();
            if !level.is_empty() {
                self.logging.level = level.to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.bridge.url)
            .map_err(|e| Error::Config(format!("Invalid bridge URL {}: {}", self.bridge.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "Bridge URL must use ws:// or wss://, got {}",
                self.bridge.url
            )));
        }
        if self.bridge.handshake_timeout_ms == 0
            || self.bridge.request_timeout_ms == 0
            || self.bridge.chat_timeout_ms == 0
        {
            return Err(Error::Config("Timeouts must be greater than zero".to_string()));
        }
        if self.bridge.subscription_buffer == 0 {
            return Err(Error::Config("subscriptionBuffer must be greater than zero".to_string()));
        }
        Ok(())
    }
}
