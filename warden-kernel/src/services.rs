//! Inventaire des services de jeu par hôte, derrière le cache de résultats.
//!
//! Chaque hôte contribue soit sa liste, soit son erreur : un hôte en panne
//! ne fait jamais échouer la réponse entière.

use crate::cache::ResultCache;
use crate::dispatch::Dispatcher;
use crate::errors::ExecError;
use crate::store::Store;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Une unité systemd telle que rapportée par `systemctl --output=json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUnit {
    pub unit: String,
    pub load: String,
    pub active: String,
    pub sub: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostServices {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceUnit>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostError {
    pub kind: &'static str,
    pub message: String,
}

pub fn parse_units(host: &str, stdout: &str) -> Result<Vec<ServiceUnit>, ExecError> {
    serde_json::from_str(stdout.trim()).map_err(|e| ExecError::Parse {
        host: host.to_string(),
        reason: format!("service listing is not a JSON unit array: {e}"),
    })
}

pub struct ServiceDirectory {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    cache: ResultCache<Vec<ServiceUnit>>,
    query_command: String,
}

impl ServiceDirectory {
    pub fn new(store: Store, dispatcher: Arc<Dispatcher>, cache: ResultCache<Vec<ServiceUnit>>, query_command: &str) -> Self {
        Self { store, dispatcher, cache, query_command: query_command.to_string() }
    }

    pub async fn host_services(&self, host: &str) -> Result<Vec<ServiceUnit>, ExecError> {
        let dispatcher = self.dispatcher.clone();
        let command = self.query_command.clone();
        let owned = host.to_string();
        self.cache
            .get_or_fetch(&format!("services:{host}"), move || async move {
                let out = dispatcher.execute(&owned, &command, None).await?;
                parse_units(&owned, &out.stdout)
            })
            .await
    }

    pub fn forget(&self, host: &str) {
        self.cache.invalidate(&format!("services:{host}"));
    }

    /// Tous les hôtes enregistrés, en parallèle
    pub async fn list_all(&self) -> Result<Vec<HostServices>, ExecError> {
        let hosts = self.store.list_hosts().await?;
        let lookups = hosts.iter().map(|host| async move {
            match self.host_services(host).await {
                Ok(services) => HostServices { host: host.clone(), services: Some(services), error: None },
                Err(e) => {
                    warn!(host = %host, error = %e, "service listing failed");
                    HostServices {
                        host: host.clone(),
                        services: None,
                        error: Some(HostError { kind: e.kind(), message: e.to_string() }),
                    }
                }
            }
        });
        Ok(join_all(lookups).await)
    }
}
