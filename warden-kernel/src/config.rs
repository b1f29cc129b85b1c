use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub database: String,
    /// URL de base du kernel, vue depuis les hôtes (install script, canal agent)
    pub panel_address: String,
    pub agent_binary_url: String,
    pub ssh: SshConf,
    pub exec: ExecConf,
    pub health: HealthConf,
    pub cache: CacheConf,
    pub retention: RetentionConf,
    pub services: ServicesConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConf {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecConf {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    pub install_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub hello_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConf {
    pub offline_threshold_secs: u64,
    pub retry_delay_secs: u64,
    pub max_attempts: u32,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConf {
    pub fresh_ttl_secs: u64,
    pub stale_ttl_secs: u64,
    pub deadline_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConf {
    pub interval_secs: u64,
    pub max_age_days: u64,
    pub bands: Vec<BandConf>,
}

/// Tranche d'âge [min_age, max_age) fusionnée en buckets de `bucket_secs`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BandConf {
    pub min_age_secs: i64,
    pub max_age_secs: i64,
    pub bucket_secs: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServicesConf {
    pub query_command: String,
}

const DAY: i64 = 86_400;

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            database: "./data/warden.db".into(),
            panel_address: "http://127.0.0.1:8080".into(),
            agent_binary_url: "http://127.0.0.1:8080/agent/warden-agent".into(),
            ssh: SshConf::default(),
            exec: ExecConf::default(),
            health: HealthConf::default(),
            cache: CacheConf::default(),
            retention: RetentionConf::default(),
            services: ServicesConf::default(),
        }
    }
}

impl Default for SshConf {
    fn default() -> Self {
        Self { user: "root".into(), port: 22, identity_file: None, connect_timeout_secs: 10 }
    }
}

impl Default for ExecConf {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_output_bytes: 100 * 1024 * 1024,
            install_timeout_secs: 300,
            ping_timeout_secs: 5,
            ping_interval_secs: 30,
            hello_timeout_secs: 10,
        }
    }
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { offline_threshold_secs: 30, retry_delay_secs: 30, max_attempts: 3, sweep_interval_secs: 15 }
    }
}

impl Default for CacheConf {
    fn default() -> Self {
        Self { fresh_ttl_secs: 30, stale_ttl_secs: DAY as u64, deadline_ms: 4_000 }
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            max_age_days: 365,
            bands: vec![
                BandConf { min_age_secs: DAY, max_age_secs: 7 * DAY, bucket_secs: 300 },
                BandConf { min_age_secs: 7 * DAY, max_age_secs: 30 * DAY, bucket_secs: 3_600 },
                BandConf { min_age_secs: 30 * DAY, max_age_secs: 365 * DAY, bucket_secs: DAY },
            ],
        }
    }
}

impl Default for ServicesConf {
    fn default() -> Self {
        Self {
            query_command: "systemctl list-units --type=service --all --output=json --no-pager 'gameserver-*'".into(),
        }
    }
}

impl ExecConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl KernelConfig {
    /// URL WebSocket du canal agent dérivée de `panel_address`
    pub fn agent_channel_url(&self) -> String {
        let base = self.panel_address.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{base}")
        };
        format!("{ws}/agent/ws")
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("WARDEN_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        warn!(path = %path, "no kernel config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    parse_config(&txt)
}

fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!(error = %e, "invalid kernel config, using defaults");
        KernelConfig::default()
    })
}
