//! Auto-réparation d'un hôte dont l'agent ne répond plus : réinstallation
//! complète par le transport shell.

use crate::errors::ExecError;
use crate::installer::{fetch_script_command, run_script_command, UNINSTALL_COMMAND};
use crate::agents::ConnectionRegistry;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Remediator: Send + Sync {
    /// Une tentative complète. Ok si l'agent a été réinstallé.
    async fn remediate(&self, host: &str) -> Result<(), ExecError>;
}

/// Arrêt / suppression de l'ancien service, récupération d'un script neuf
/// avec le token de l'hôte, puis exécution du script.
pub struct AgentReinstaller {
    shell: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    step_timeout: Duration,
    install_timeout: Duration,
}

impl AgentReinstaller {
    pub fn new(
        shell: Arc<dyn Transport>,
        registry: Arc<ConnectionRegistry>,
        step_timeout: Duration,
        install_timeout: Duration,
    ) -> Self {
        Self { shell, registry, step_timeout, install_timeout }
    }

    async fn step(&self, host: &str, name: &str, command: &str, timeout: Duration) -> Result<(), ExecError> {
        let out = self.shell.run(host, command, timeout).await?;
        if out.exit_code == 0 {
            Ok(())
        } else {
            Err(ExecError::Transport {
                host: host.to_string(),
                transport: out.transport,
                exit_code: Some(out.exit_code),
                message: format!("{name} exited with status {}", out.exit_code),
                stdout: out.stdout,
                stderr: out.stderr,
            })
        }
    }
}

#[async_trait]
impl Remediator for AgentReinstaller {
    async fn remediate(&self, host: &str) -> Result<(), ExecError> {
        info!(host = %host, "remediation: reinstalling agent");

        if let Err(e) = self.step(host, "stop", UNINSTALL_COMMAND, self.step_timeout).await {
            warn!(host = %host, error = %e, "remediation: stop step failed, continuing");
        }

        let token = self.registry.upsert_token(host, None).await?;
        let fetch = fetch_script_command(self.registry.panel_address(), &token);
        if let Err(e) = self.step(host, "fetch", &fetch, self.step_timeout).await {
            warn!(host = %host, error = %e, "remediation: fetch step failed, continuing");
        }

        self.step(host, "install", &run_script_command(), self.install_timeout).await?;
        info!(host = %host, "remediation: install script completed");
        Ok(())
    }
}
