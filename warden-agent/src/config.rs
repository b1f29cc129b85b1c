//! Agent configuration
//!
//! Written by the kernel's install script at `/etc/warden-agent/config.toml`:
//! - `host`: identifier the kernel registered this machine under
//! - `token`: shared secret presented on the agent channel
//! - `kernel_url`: WebSocket endpoint (`ws://panel:8080/agent/ws`)
//!
//! The path can be overridden with `WARDEN_AGENT_CONFIG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "WARDEN_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub token: String,
    pub kernel_url: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Ceiling applied to each captured stream of a buffered command
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { min_backoff_secs: 1, max_backoff_secs: 60 }
    }
}

impl ReconnectConfig {
    pub fn min(&self) -> Duration {
        Duration::from_secs(self.min_backoff_secs.max(1))
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(self.min_backoff_secs).max(1))
    }

    /// Next delay after a failed attempt, doubling up to the ceiling
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max())
    }
}

fn default_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn default_max_output() -> usize {
    100 * 1024 * 1024
}

impl AgentConfig {
    /// Load config from `WARDEN_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(p) => PathBuf::from(p),
            Err(_) => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        if config.token.trim().is_empty() {
            anyhow::bail!("token must not be empty");
        }
        Ok(config)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("warden-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Channel URL carrying the token as query parameter
    pub fn channel_url(&self) -> String {
        let sep = if self.kernel_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.kernel_url, sep, self.token)
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}
