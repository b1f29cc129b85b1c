use serde::{Deserialize, Serialize};
use std::fmt;

/// État persistant d'une connexion agent (colonne `status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connected,
    Disconnected,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Connected => "connected",
            AgentStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "connected" => AgentStatus::Connected,
            _ => AgentStatus::Disconnected,
        }
    }
}

/// Ligne `agent_connections` : une par hôte au maximum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConnection {
    pub host: String,
    pub token: String,
    pub status: AgentStatus,
    pub version: Option<String>,
    pub connected_at: Option<i64>,
    pub last_ping: Option<i64>,
}

/// Transport effectivement utilisé pour une commande
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Agent,
    Ssh,
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Agent => "agent",
            TransportKind::Ssh => "ssh",
            TransportKind::Local => "local",
        };
        f.write_str(name)
    }
}

/// Résultat normalisé d'une exécution bufferisée
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub transport: TransportKind,
}

/// Flux d'origine d'un morceau de sortie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Une observation de télémétrie (host, application, service, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub host: String,
    pub application: String,
    pub service: String,
    /// Secondes epoch
    pub timestamp: i64,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub player_count: Option<i64>,
    pub response_time: Option<f64>,
    pub status: Option<i64>,
}

/// Heure courante en secondes epoch
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Identifiant d'hôte accepté à l'enregistrement : nom DNS, IPv4 ou IPv6.
/// Il finit dans la ligne de commande ssh et dans le script d'installation.
pub fn is_valid_host_id(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('-')
        && host.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}
