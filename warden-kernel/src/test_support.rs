//! Doublures de test : store en mémoire, transport espion, agent simulé,
//! remédiateur scripté.

use crate::agents::ConnectionRegistry;
use crate::channel::{AgentFrame, AgentHandle, KernelFrame};
use crate::errors::ExecError;
use crate::models::{ExecOutput, StreamName, TransportKind};
use crate::remediation::Remediator;
use crate::state::{new_state, Shared};
use crate::store::Store;
use crate::transport::{OutputSink, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn store_with_hosts(hosts: &[&str]) -> Store {
    let store = Store::open_in_memory().await.unwrap();
    for host in hosts {
        store.add_host(host).await.unwrap();
    }
    store
}

pub async fn registry_with(shell: Arc<FakeTransport>, hosts: &[&str]) -> (Arc<ConnectionRegistry>, Store) {
    let store = store_with_hosts(hosts).await;
    let registry = ConnectionRegistry::new(store.clone(), shell, "http://panel.test:8080", Duration::from_secs(60));
    (Arc::new(registry), store)
}

type Responder = Box<dyn Fn(&str, &str) -> Result<ExecOutput, ExecError> + Send + Sync>;

/// Transport espion : enregistre chaque appel, répond selon un script
pub struct FakeTransport {
    kind: TransportKind,
    calls: Shared<Vec<(String, String)>>,
    responder: Responder,
    delay: Option<Duration>,
    /// En flux : un premier morceau puis attente de l'annulation
    hold_stream: bool,
    cancelled: Arc<AtomicBool>,
}

impl FakeTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            calls: new_state(Vec::new()),
            responder: Box::new(move |_, _| {
                Ok(ExecOutput { stdout: "ok\n".into(), stderr: String::new(), exit_code: 0, transport: kind })
            }),
            delay: None,
            hold_stream: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ssh() -> Self {
        Self::new(TransportKind::Ssh)
    }

    pub fn responding<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> Result<ExecOutput, ExecError> + Send + Sync + 'static,
    {
        self.responder = Box::new(f);
        self
    }

    pub fn printing(self, stdout: &str) -> Self {
        let (kind, stdout) = (self.kind, stdout.to_string());
        self.responding(move |_, _| {
            Ok(ExecOutput { stdout: stdout.clone(), stderr: String::new(), exit_code: 0, transport: kind })
        })
    }

    pub fn exiting(self, exit_code: i32, stderr: &str) -> Self {
        let (kind, stderr) = (self.kind, stderr.to_string());
        self.responding(move |_, _| {
            Ok(ExecOutput { stdout: String::new(), stderr: stderr.clone(), exit_code, transport: kind })
        })
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn holding_stream(mut self) -> Self {
        self.hold_stream = true;
        self
    }

    /// Vrai si un flux en attente a vu son token annulé
    pub fn saw_cancel(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(h, _)| h.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn run(&self, host: &str, command: &str, _timeout: Duration) -> Result<ExecOutput, ExecError> {
        self.calls.lock().push((host.to_string(), command.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(host, command)
    }

    async fn stream(
        &self,
        host: &str,
        command: &str,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError> {
        self.calls.lock().push((host.to_string(), command.to_string()));
        if self.hold_stream {
            sink.on_chunk(StreamName::Stdout, "first line\n");
            cancel.cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            return Err(ExecError::Cancelled { host: host.to_string() });
        }
        let out = (self.responder)(host, command)?;
        if !out.stdout.is_empty() {
            sink.on_chunk(StreamName::Stdout, &out.stdout);
        }
        if !out.stderr.is_empty() {
            sink.on_chunk(StreamName::Stderr, &out.stderr);
        }
        Ok(out.exit_code)
    }
}

/// Comportement de l'agent simulé pour une commande
pub enum AgentScript {
    Reply { stdout: String, exit_code: i32 },
    /// Morceaux envoyés puis fermeture du canal sans résultat
    ChunksThenDrop(Vec<String>),
    Fail(String),
    Silent,
}

/// Attache un agent simulé au registre et sert ses trames en tâche de fond
pub async fn connect_fake_agent<F>(registry: &Arc<ConnectionRegistry>, host: &str, script: F) -> AgentHandle
where
    F: Fn(&str) -> AgentScript + Send + 'static,
{
    registry.upsert_token(host, None).await.unwrap();
    let (handle, mut outbound) = registry.attach(host, "test-agent").await;
    let agent = handle.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                frame = outbound.recv() => frame,
                _ = agent.closed() => None,
            };
            let Some(frame) = frame else { break };
            match frame {
                KernelFrame::Exec { request_id, command, stream, .. } => match script(&command) {
                    AgentScript::Reply { stdout, exit_code } => {
                        if stream {
                            agent.deliver(AgentFrame::Chunk {
                                request_id: request_id.clone(),
                                stream: StreamName::Stdout,
                                data: stdout.clone(),
                            });
                        }
                        agent.deliver(AgentFrame::Completed { request_id, stdout, stderr: String::new(), exit_code });
                    }
                    AgentScript::ChunksThenDrop(chunks) => {
                        for data in chunks {
                            agent.deliver(AgentFrame::Chunk {
                                request_id: request_id.clone(),
                                stream: StreamName::Stdout,
                                data,
                            });
                        }
                        agent.close();
                    }
                    AgentScript::Fail(error) => agent.deliver(AgentFrame::Failed { request_id, error }),
                    AgentScript::Silent => {}
                },
                KernelFrame::Ping { nonce } => agent.deliver(AgentFrame::Pong { nonce }),
                KernelFrame::Cancel { .. } => {}
            }
        }
    });
    handle
}

/// Remédiateur scripté : succès ou échec, avec délai optionnel
pub struct FakeRemediator {
    calls: Shared<Vec<String>>,
    succeed: AtomicBool,
    delay: Option<Duration>,
}

impl FakeRemediator {
    pub fn failing() -> Self {
        Self { calls: new_state(Vec::new()), succeed: AtomicBool::new(false), delay: None }
    }

    pub fn succeeding() -> Self {
        Self { calls: new_state(Vec::new()), succeed: AtomicBool::new(true), delay: None }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Remediator for FakeRemediator {
    async fn remediate(&self, host: &str) -> Result<(), ExecError> {
        self.calls.lock().push(host.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.succeed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExecError::Transport {
                host: host.to_string(),
                transport: TransportKind::Ssh,
                exit_code: Some(1),
                message: "install script failed".into(),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}

/// Laisse tourner les tâches lancées en arrière-plan
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
