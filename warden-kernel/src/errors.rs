/**
 * ERREURS D'EXÉCUTION - Taxonomie commune au dispatcher, au cache et à la santé
 *
 * RÔLE :
 * Distinguer "hôte inconnu", "transport trop lent", "transport en échec",
 * "hôte joignable mais sortie illisible" et "auto-réparation épuisée" pour que
 * les appelants puissent attribuer correctement chaque échec.
 *
 * PROPAGATION :
 * - Les erreurs de transport portent stdout/stderr partiels et le transport utilisé
 * - L'échec agent est récupéré une seule fois (bascule shell) dans le dispatcher
 * - Le health monitor ne propage jamais : il dégrade en champs de statut
 */

use crate::models::TransportKind;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("{transport} command on {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        transport: TransportKind,
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    /// Code de sortie non nul (`exit_code` renseigné) ou erreur de canal (`None`)
    #[error("{transport} command on {host} failed: {message}")]
    Transport {
        host: String,
        transport: TransportKind,
        exit_code: Option<i32>,
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("unexpected output from {host}: {reason}")]
    Parse { host: String, reason: String },

    #[error("host {host} exhausted {attempts} remediation attempts, operator action required")]
    RemediationExhausted { host: String, attempts: u32 },

    #[error("no cached value for {key} and fetch missed its {deadline:?} deadline")]
    Deadline { key: String, deadline: Duration },

    #[error("command on {host} cancelled")]
    Cancelled { host: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn channel(host: &str, message: impl Into<String>) -> Self {
        ExecError::Transport {
            host: host.to_string(),
            transport: TransportKind::Agent,
            exit_code: None,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Nom court utilisé dans les réponses JSON
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::UnknownHost(_) => "unknown_host",
            ExecError::Timeout { .. } => "transport_timeout",
            ExecError::Transport { .. } => "transport_failure",
            ExecError::Parse { .. } => "parse_failure",
            ExecError::RemediationExhausted { .. } => "remediation_exhausted",
            ExecError::Deadline { .. } => "deadline",
            ExecError::Cancelled { .. } => "cancelled",
            ExecError::Store(_) => "store",
            ExecError::Internal(_) => "internal",
        }
    }

    pub fn transport(&self) -> Option<TransportKind> {
        match self {
            ExecError::Timeout { transport, .. } | ExecError::Transport { transport, .. } => {
                Some(*transport)
            }
            _ => None,
        }
    }

    /// Sortie partielle capturée avant l'échec
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            ExecError::Timeout { stdout, stderr, .. } | ExecError::Transport { stdout, stderr, .. } => {
                Some((stdout, stderr))
            }
            _ => None,
        }
    }

    /// Échec du canal agent qui justifie la bascule vers le shell
    pub fn is_channel_failure(&self) -> bool {
        match self {
            ExecError::Timeout { transport, .. } => *transport == TransportKind::Agent,
            ExecError::Transport { transport, exit_code, .. } => {
                *transport == TransportKind::Agent && exit_code.is_none()
            }
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
