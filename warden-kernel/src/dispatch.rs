/**
 * DISPATCHER D'EXÉCUTION - Point d'entrée unique "exécuter une commande sur l'hôte X"
 *
 * RÔLE :
 * Choisir le transport (agent si son canal est vivant, shell sinon), basculer
 * une seule fois vers le shell quand le canal agent échoue, et normaliser
 * le résultat en `ExecOutput` ou `ExecError`.
 *
 * FONCTIONNEMENT :
 * - Hôte inconnu → `UnknownHost` sans toucher aucun transport
 * - Canal vivant : le shell n'est jamais invoqué, sauf bascule après échec
 *   du canal (timeout, fermeture, échec de lancement côté agent)
 * - Code de sortie non nul → `ExecError::Transport` avec sortie capturée
 * - Flux : bascule possible tant qu'aucun morceau n'a été transmis ;
 *   exactement un `on_done` ou `on_error` par appel
 */

use crate::agents::ConnectionRegistry;
use crate::errors::ExecError;
use crate::models::ExecOutput;
use crate::store::Store;
use crate::transport::{OutputSink, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Dispatcher {
    store: Store,
    registry: Arc<ConnectionRegistry>,
    agent: Arc<dyn Transport>,
    shell: Arc<dyn Transport>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        registry: Arc<ConnectionRegistry>,
        agent: Arc<dyn Transport>,
        shell: Arc<dyn Transport>,
        default_timeout: Duration,
    ) -> Self {
        Self { store, registry, agent, shell, default_timeout }
    }

    async fn ensure_known(&self, host: &str) -> Result<(), ExecError> {
        if self.store.host_exists(host).await? {
            Ok(())
        } else {
            Err(ExecError::UnknownHost(host.to_string()))
        }
    }

    /// Exécution bufferisée
    pub async fn execute(&self, host: &str, command: &str, timeout: Option<Duration>) -> Result<ExecOutput, ExecError> {
        self.ensure_known(host).await?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        let output = if self.registry.is_live(host) {
            debug!(host = %host, "dispatching over agent channel");
            match self.agent.run(host, command, timeout).await {
                Ok(out) => out,
                Err(e) if e.is_channel_failure() => {
                    warn!(host = %host, error = %e, "agent channel failed, falling back to shell");
                    self.shell.run(host, command, timeout).await?
                }
                Err(e) => return Err(e),
            }
        } else {
            debug!(host = %host, "no live agent, dispatching over shell");
            self.shell.run(host, command, timeout).await?
        };

        classify(host, output)
    }

    /// Exécution en flux vers `sink`, annulable
    pub async fn stream_execute(
        &self,
        host: &str,
        command: &str,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError> {
        let result = self.stream_inner(host, command, sink, cancel).await;
        match &result {
            Ok(code) => sink.on_done(*code),
            Err(e) => sink.on_error(&e.to_string()),
        }
        result
    }

    async fn stream_inner(
        &self,
        host: &str,
        command: &str,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError> {
        self.ensure_known(host).await?;

        if !self.registry.is_live(host) {
            return self.shell.stream(host, command, sink, cancel).await;
        }

        match self.agent.stream(host, command, sink, cancel.clone()).await {
            Err(e) if e.is_channel_failure() && sink.chunks_sent() == 0 => {
                warn!(host = %host, error = %e, "agent stream failed before output, falling back to shell");
                self.shell.stream(host, command, sink, cancel).await
            }
            other => other,
        }
    }
}

fn classify(host: &str, output: ExecOutput) -> Result<ExecOutput, ExecError> {
    if output.exit_code == 0 {
        return Ok(output);
    }
    Err(ExecError::Transport {
        host: host.to_string(),
        transport: output.transport,
        exit_code: Some(output.exit_code),
        message: format!("exit status {}", output.exit_code),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}
