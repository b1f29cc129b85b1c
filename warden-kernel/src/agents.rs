/**
 * REGISTRE DES CONNEXIONS AGENTS - Qui est joignable par canal agent, et comment l'installer
 *
 * RÔLE :
 * Suivre, par hôte, le canal agent vivant (table en mémoire des handles) et
 * son enregistrement persistant (token, statut, version, horodatages).
 * Installer / désinstaller l'agent via le transport shell.
 *
 * FONCTIONNEMENT :
 * - `is_live` : un handle existe ET son socket est ouvert ; la ligne
 *   `agent_connections` seule ne suffit jamais
 * - Attache : remplace une éventuelle session précédente du même hôte
 * - Détache : uniquement si la session est encore la courante (une
 *   reconnexion rapide ne doit pas être effacée par l'ancienne session)
 * - Install / uninstall idempotents ; le token existant est conservé
 */

use crate::channel::{AgentHandle, KernelFrame};
use crate::errors::{ExecError, StoreError};
use crate::installer::{install_command, UNINSTALL_COMMAND};
use crate::models::{unix_now, AgentConnection};
use crate::state::{new_host_table, HostTable};
use crate::store::Store;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Résultat d'une installation d'agent
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub already_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UninstallOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub struct ConnectionRegistry {
    store: Store,
    live: HostTable<AgentHandle>,
    shell: Arc<dyn Transport>,
    panel_address: String,
    install_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(store: Store, shell: Arc<dyn Transport>, panel_address: &str, install_timeout: Duration) -> Self {
        Self {
            store,
            live: new_host_table(),
            shell,
            panel_address: panel_address.to_string(),
            install_timeout,
        }
    }

    /// Vrai si un canal agent ouvert existe pour cet hôte
    pub fn is_live(&self, host: &str) -> bool {
        self.live.lock().get(host).is_some_and(AgentHandle::is_open)
    }

    pub fn handle(&self, host: &str) -> Option<AgentHandle> {
        self.live.lock().get(host).filter(|h| h.is_open()).cloned()
    }

    pub fn live_handles(&self) -> Vec<AgentHandle> {
        self.live.lock().values().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().values().filter(|h| h.is_open()).count()
    }

    /// Enregistre une nouvelle session et retourne le récepteur des trames sortantes
    pub async fn attach(&self, host: &str, version: &str) -> (AgentHandle, mpsc::UnboundedReceiver<KernelFrame>) {
        let (handle, outbound) = AgentHandle::new(host, version);
        let previous = self.live.lock().insert(host.to_string(), handle.clone());
        if let Some(old) = previous {
            info!(host = %host, old_session = %old.session_id, "replacing previous agent session");
            old.close();
        }
        self.record_connect(host, version).await;
        (handle, outbound)
    }

    /// Retire la session si elle est toujours la courante
    pub async fn detach(&self, host: &str, session_id: Uuid) {
        let removed = {
            let mut live = self.live.lock();
            match live.get(host) {
                Some(current) if current.session_id == session_id => live.remove(host),
                _ => None,
            }
        };
        if let Some(handle) = removed {
            handle.close();
            self.record_disconnect(host).await;
        }
    }

    pub async fn record_connect(&self, host: &str, version: &str) {
        if let Err(e) = self.store.set_agent_connected(host, version, unix_now()).await {
            error!(host = %host, error = %e, "failed to persist agent connect");
        }
    }

    pub async fn record_disconnect(&self, host: &str) {
        if let Err(e) = self.store.set_agent_disconnected(host).await {
            error!(host = %host, error = %e, "failed to persist agent disconnect");
        }
    }

    pub async fn note_ping(&self, host: &str) {
        if let Err(e) = self.store.touch_agent_ping(host, unix_now()).await {
            warn!(host = %host, error = %e, "failed to persist agent ping");
        }
    }

    /// Fixe le token d'un hôte. Sans token fourni : conserve l'existant, sinon en génère un.
    pub async fn upsert_token(&self, host: &str, token: Option<&str>) -> Result<String, ExecError> {
        if !self.store.host_exists(host).await? {
            return Err(ExecError::UnknownHost(host.to_string()));
        }
        let token = match token {
            Some(t) => t.to_string(),
            None => match self.store.get_agent(host).await? {
                Some(existing) => return Ok(existing.token),
                None => new_token(),
            },
        };
        self.store.upsert_agent_token(host, &token).await?;
        Ok(token)
    }

    /// Nouveau token ; un canal déjà ouvert avec l'ancien reste attaché
    pub async fn regenerate_token(&self, host: &str) -> Result<String, ExecError> {
        let token = new_token();
        self.upsert_token(host, Some(&token)).await?;
        info!(host = %host, "agent token regenerated");
        Ok(token)
    }

    /// Hôte propriétaire du token, s'il existe
    pub async fn authenticate(&self, token: &str) -> Result<Option<String>, StoreError> {
        Ok(self.store.agent_by_token(token).await?.map(|a| a.host))
    }

    pub async fn connection(&self, host: &str) -> Result<Option<AgentConnection>, StoreError> {
        self.store.get_agent(host).await
    }

    pub fn panel_address(&self) -> &str {
        &self.panel_address
    }

    /// Installe l'agent via le transport shell. Hôte déjà vivant : succès sans action.
    pub async fn install_on(&self, host: &str, panel_address: Option<&str>) -> Result<InstallOutcome, ExecError> {
        if !self.store.host_exists(host).await? {
            return Err(ExecError::UnknownHost(host.to_string()));
        }
        if self.is_live(host) {
            info!(host = %host, "agent already connected, install skipped");
            return Ok(InstallOutcome { success: true, already_installed: true, ..Default::default() });
        }

        let token = self.upsert_token(host, None).await?;
        let panel = panel_address.unwrap_or(&self.panel_address);
        info!(host = %host, panel = %panel, "installing agent");

        match self.shell.run(host, &install_command(panel, &token), self.install_timeout).await {
            Ok(out) if out.exit_code == 0 => {
                info!(host = %host, "agent install script completed");
                Ok(InstallOutcome {
                    success: true,
                    already_installed: false,
                    stdout: Some(out.stdout),
                    stderr: Some(out.stderr),
                    error: None,
                })
            }
            Ok(out) => {
                warn!(host = %host, exit_code = out.exit_code, "agent install script failed");
                Ok(InstallOutcome {
                    success: false,
                    already_installed: false,
                    error: Some(format!("install script exited with status {}", out.exit_code)),
                    stdout: Some(out.stdout),
                    stderr: Some(out.stderr),
                })
            }
            Err(e) => {
                warn!(host = %host, error = %e, "agent install failed");
                let (stdout, stderr) = e
                    .captured_output()
                    .map(|(o, e)| (Some(o.to_string()), Some(e.to_string())))
                    .unwrap_or((None, None));
                Ok(InstallOutcome { success: false, already_installed: false, stdout, stderr, error: Some(e.to_string()) })
            }
        }
    }

    /// Désinstalle l'agent. Rien d'installé : succès sans action.
    pub async fn uninstall_from(&self, host: &str) -> Result<UninstallOutcome, ExecError> {
        let record = self.store.get_agent(host).await?;
        if record.is_none() && !self.is_live(host) {
            return Ok(UninstallOutcome { success: true, error: None });
        }

        let failure = match self.shell.run(host, UNINSTALL_COMMAND, self.install_timeout).await {
            Ok(out) if out.exit_code == 0 => None,
            Ok(out) => Some(format!("uninstall exited with status {}: {}", out.exit_code, out.stderr.trim())),
            Err(e) => Some(e.to_string()),
        };
        if let Some(error) = failure {
            warn!(host = %host, error = %error, "agent uninstall failed");
            return Ok(UninstallOutcome { success: false, error: Some(error) });
        }

        self.store.delete_agent(host).await?;
        let handle = self.live.lock().remove(host);
        if let Some(handle) = handle {
            handle.close();
        }
        info!(host = %host, "agent uninstalled");
        Ok(UninstallOutcome { success: true, error: None })
    }

    /// Oublie tout état en mémoire d'un hôte retiré du parc
    pub fn forget(&self, host: &str) {
        if let Some(handle) = self.live.lock().remove(host) {
            handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentStatus;
    use crate::test_support::{registry_with, FakeTransport};

    #[tokio::test]
    async fn test_live_requires_open_handle() {
        let shell = Arc::new(FakeTransport::ssh());
        let (registry, store) = registry_with(shell, &["h1"]).await;
        registry.upsert_token("h1", None).await.unwrap();
        assert!(!registry.is_live("h1"));

        let (handle, outbound) = registry.attach("h1", "1.2.0").await;
        assert!(registry.is_live("h1"));
        let row = store.get_agent("h1").await.unwrap().unwrap();
        assert_eq!(row.status, AgentStatus::Connected);
        assert_eq!(row.version.as_deref(), Some("1.2.0"));

        // socket fermé : la ligne dit encore "connected", mais pas vivant
        drop(outbound);
        assert!(!registry.is_live("h1"));

        registry.detach("h1", handle.session_id).await;
        let row = store.get_agent("h1").await.unwrap().unwrap();
        assert_eq!(row.status, AgentStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_session_does_not_detach_new_one() {
        let (registry, store) = registry_with(Arc::new(FakeTransport::ssh()), &["h1"]).await;
        registry.upsert_token("h1", None).await.unwrap();

        let (old, _old_rx) = registry.attach("h1", "1.0.0").await;
        let (_new, _new_rx) = registry.attach("h1", "1.1.0").await;
        assert!(!old.is_open());

        registry.detach("h1", old.session_id).await;
        assert!(registry.is_live("h1"));
        let row = store.get_agent("h1").await.unwrap().unwrap();
        assert_eq!(row.status, AgentStatus::Connected);
    }

    #[tokio::test]
    async fn test_install_twice_keeps_token() {
        let shell = Arc::new(FakeTransport::ssh());
        let (registry, _store) = registry_with(shell.clone(), &["h1"]).await;

        let first = registry.install_on("h1", None).await.unwrap();
        assert!(first.success);
        let token = registry.upsert_token("h1", None).await.unwrap();

        let second = registry.install_on("h1", None).await.unwrap();
        assert!(second.success);
        assert_eq!(registry.upsert_token("h1", None).await.unwrap(), token);
        assert!(shell.commands().iter().all(|c| c.contains(&format!("token={token}"))));
    }

    #[tokio::test]
    async fn test_install_on_live_host_is_noop() {
        let shell = Arc::new(FakeTransport::ssh());
        let (registry, _store) = registry_with(shell.clone(), &["h1"]).await;
        registry.upsert_token("h1", None).await.unwrap();
        let (_handle, _rx) = registry.attach("h1", "1.0.0").await;

        let outcome = registry.install_on("h1", None).await.unwrap();
        assert!(outcome.success && outcome.already_installed);
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_install_failure_reports_output() {
        let shell = Arc::new(FakeTransport::ssh().exiting(1, "curl: (22) 404"));
        let (registry, _store) = registry_with(shell, &["h1"]).await;
        let outcome = registry.install_on("h1", Some("http://elsewhere:9000")).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.stderr.as_deref(), Some("curl: (22) 404"));
    }

    #[tokio::test]
    async fn test_install_unknown_host() {
        let (registry, _store) = registry_with(Arc::new(FakeTransport::ssh()), &[]).await;
        assert!(matches!(registry.install_on("ghost", None).await, Err(ExecError::UnknownHost(_))));
    }

    #[tokio::test]
    async fn test_uninstall_idempotent() {
        let shell = Arc::new(FakeTransport::ssh());
        let (registry, store) = registry_with(shell.clone(), &["h1"]).await;

        // rien d'installé
        assert!(registry.uninstall_from("h1").await.unwrap().success);
        assert!(shell.commands().is_empty());

        registry.upsert_token("h1", None).await.unwrap();
        assert!(registry.uninstall_from("h1").await.unwrap().success);
        assert!(store.get_agent("h1").await.unwrap().is_none());
        assert_eq!(shell.commands().len(), 1);

        assert!(registry.uninstall_from("h1").await.unwrap().success);
        assert_eq!(shell.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_uninstall_keeps_row() {
        let shell = Arc::new(FakeTransport::ssh().exiting(255, "ssh: connect refused"));
        let (registry, store) = registry_with(shell, &["h1"]).await;
        registry.upsert_token("h1", None).await.unwrap();

        let outcome = registry.uninstall_from("h1").await.unwrap();
        assert!(!outcome.success);
        assert!(store.get_agent("h1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authenticate_and_regenerate() {
        let (registry, _store) = registry_with(Arc::new(FakeTransport::ssh()), &["h1"]).await;
        let token = registry.upsert_token("h1", None).await.unwrap();
        assert_eq!(registry.authenticate(&token).await.unwrap().as_deref(), Some("h1"));

        let fresh = registry.regenerate_token("h1").await.unwrap();
        assert_ne!(fresh, token);
        assert!(registry.authenticate(&token).await.unwrap().is_none());
        assert_eq!(registry.authenticate(&fresh).await.unwrap().as_deref(), Some("h1"));
    }
}
