/**
 * CANAL AGENT - Liaison persistante kernel ↔ agent résident (WebSocket)
 *
 * RÔLE :
 * Porter les commandes du kernel vers l'agent d'un hôte et corréler les
 * réponses. Un `AgentHandle` ouvert dans le registre EST le signal de
 * vivacité faisant autorité (la colonne `status` peut être en retard).
 *
 * FONCTIONNEMENT :
 * - L'agent ouvre `/agent/ws?token=…` puis envoie `hello` (version)
 * - Requêtes corrélées par `request_id` : oneshot pour les réponses
 *   bufferisées, canal non borné pour les flux
 * - `ping`/`pong` corrélés par `nonce` pour la sonde de vivacité
 * - Fermeture du socket : toutes les requêtes en attente échouent, la
 *   session est détachée du registre (si elle est toujours la courante)
 */

use crate::agents::ConnectionRegistry;
use crate::errors::ExecError;
use crate::models::{StreamName, TransportKind};
use crate::state::{new_state, Shared};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages kernel → agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelFrame {
    Exec {
        request_id: String,
        command: String,
        timeout_ms: u64,
        workdir: Option<String>,
        stream: bool,
    },
    Cancel {
        request_id: String,
    },
    Ping {
        nonce: String,
    },
}

/// Messages agent → kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Hello {
        version: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Chunk {
        request_id: String,
        stream: StreamName,
        data: String,
    },
    #[serde(rename = "result")]
    Completed {
        request_id: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    Failed {
        request_id: String,
        error: String,
    },
    Pong {
        nonce: String,
    },
}

impl AgentFrame {
    fn correlation_id(&self) -> Option<&str> {
        match self {
            AgentFrame::Hello { .. } => None,
            AgentFrame::Chunk { request_id, .. }
            | AgentFrame::Completed { request_id, .. }
            | AgentFrame::Failed { request_id, .. } => Some(request_id),
            AgentFrame::Pong { nonce } => Some(nonce),
        }
    }
}

enum Pending {
    Reply(oneshot::Sender<AgentFrame>),
    Stream(mpsc::UnboundedSender<AgentFrame>),
}

/// Session agent vivante, clonable
#[derive(Clone)]
pub struct AgentHandle {
    pub host: String,
    pub session_id: Uuid,
    pub version: String,
    outbound: mpsc::UnboundedSender<KernelFrame>,
    pending: Shared<HashMap<String, Pending>>,
    closed: CancellationToken,
}

impl AgentHandle {
    /// Crée un handle et le récepteur des trames sortantes (côté socket)
    pub fn new(host: &str, version: &str) -> (Self, mpsc::UnboundedReceiver<KernelFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            host: host.to_string(),
            session_id: Uuid::new_v4(),
            version: version.to_string(),
            outbound,
            pending: new_state(HashMap::new()),
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }

    /// Ferme la session : le socket est relâché, les attentes échouent
    pub fn close(&self) {
        self.closed.cancel();
        self.pending.lock().clear();
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn send(&self, frame: KernelFrame) -> Result<(), ExecError> {
        if !self.is_open() {
            return Err(ExecError::channel(&self.host, "agent channel closed"));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ExecError::channel(&self.host, "agent channel closed"))
    }

    /// Commande bufferisée : attend `Completed` ou `Failed` jusqu'à `wait`
    pub async fn request(&self, command: &str, wait: Duration, workdir: Option<String>) -> Result<AgentFrame, ExecError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), Pending::Reply(tx));

        let frame = KernelFrame::Exec {
            request_id: request_id.clone(),
            command: command.to_string(),
            timeout_ms: wait.as_millis() as u64,
            workdir,
            stream: false,
        };
        if let Err(e) = self.send(frame) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ExecError::channel(&self.host, "agent channel closed before reply")),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                self.cancel(&request_id);
                Err(ExecError::Timeout {
                    host: self.host.clone(),
                    transport: TransportKind::Agent,
                    timeout: wait,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }

    /// Commande en flux : les trames `Chunk` puis la trame terminale arrivent sur le récepteur
    pub fn open_stream(
        &self,
        command: &str,
        workdir: Option<String>,
    ) -> Result<(String, mpsc::UnboundedReceiver<AgentFrame>), ExecError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(request_id.clone(), Pending::Stream(tx));

        let frame = KernelFrame::Exec {
            request_id: request_id.clone(),
            command: command.to_string(),
            timeout_ms: 0,
            workdir,
            stream: true,
        };
        if let Err(e) = self.send(frame) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }
        Ok((request_id, rx))
    }

    pub fn cancel(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
        let _ = self.send(KernelFrame::Cancel { request_id: request_id.to_string() });
    }

    /// Sonde de vivacité ; false si pas de `pong` dans le délai
    pub async fn ping(&self, wait: Duration) -> bool {
        let nonce = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(nonce.clone(), Pending::Reply(tx));
        if self.send(KernelFrame::Ping { nonce: nonce.clone() }).is_err() {
            self.pending.lock().remove(&nonce);
            return false;
        }
        match timeout(wait, rx).await {
            Ok(Ok(AgentFrame::Pong { .. })) => true,
            _ => {
                self.pending.lock().remove(&nonce);
                false
            }
        }
    }

    /// Route une trame entrante vers la requête en attente
    pub fn deliver(&self, frame: AgentFrame) {
        let Some(id) = frame.correlation_id().map(str::to_string) else {
            return;
        };
        let mut pending = self.pending.lock();
        let terminal = !matches!(frame, AgentFrame::Chunk { .. });
        match pending.get(&id) {
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(frame);
                if terminal {
                    pending.remove(&id);
                }
            }
            Some(Pending::Reply(_)) if terminal => {
                if let Some(Pending::Reply(tx)) = pending.remove(&id) {
                    let _ = tx.send(frame);
                }
            }
            Some(Pending::Reply(_)) => {}
            None => debug!(host = %self.host, id = %id, "frame for unknown request"),
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

async fn next_frame<S>(stream: &mut S) -> Option<AgentFrame>
where
    S: futures::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<AgentFrame>(text.as_str()) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!(error = %e, "invalid agent frame"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Boucle de session d'un agent authentifié (après upgrade WebSocket)
pub async fn serve_agent_socket(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    host: String,
    hello_timeout: Duration,
) {
    let (mut sink, mut stream) = socket.split();

    let version = match timeout(hello_timeout, next_frame(&mut stream)).await {
        Ok(Some(AgentFrame::Hello { version, .. })) => version,
        Ok(Some(other)) => {
            warn!(host = %host, frame = ?other, "agent did not start with hello");
            return;
        }
        _ => {
            warn!(host = %host, "agent hello missing or late");
            return;
        }
    };

    let (handle, mut outbound) = registry.attach(&host, &version).await;
    info!(host = %host, version = %version, session = %handle.session_id, "agent channel attached");

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let payload = match serde_json::to_string(&frame) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(host = %host, error = %e, "failed to encode kernel frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            frame = next_frame(&mut stream) => {
                let Some(frame) = frame else { break };
                if matches!(frame, AgentFrame::Pong { .. }) {
                    registry.note_ping(&host).await;
                }
                handle.deliver(frame);
            }
            _ = handle.closed() => break,
        }
    }

    handle.close();
    let _ = sink.close().await;
    registry.detach(&host, handle.session_id).await;
    info!(host = %host, session = %handle.session_id, "agent channel closed");
}

/// Sonde périodique : un agent qui ne répond pas au ping est détaché
pub fn spawn_liveness_pinger(registry: Arc<ConnectionRegistry>, every: Duration, ping_timeout: Duration) {
    info!(interval_secs = every.as_secs(), "starting agent liveness pinger");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let handles = registry.live_handles();
            let pings = handles.iter().map(|h| async move { (h, h.ping(ping_timeout).await) });
            for (handle, alive) in futures::future::join_all(pings).await {
                if !alive {
                    warn!(host = %handle.host, "agent missed ping, detaching");
                    handle.close();
                    registry.detach(&handle.host, handle.session_id).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let frame = KernelFrame::Exec {
            request_id: "r1".into(),
            command: "uptime".into(),
            timeout_ms: 5000,
            workdir: None,
            stream: false,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "exec");
        assert_eq!(json["timeout_ms"], 5000);

        let reply: AgentFrame =
            serde_json::from_str(r#"{"type":"result","request_id":"r1","stdout":"up","stderr":"","exit_code":0}"#)
                .unwrap();
        assert!(matches!(reply, AgentFrame::Completed { exit_code: 0, .. }));

        let hello: AgentFrame = serde_json::from_str(r#"{"type":"hello","version":"0.3.1"}"#).unwrap();
        assert_eq!(hello, AgentFrame::Hello { version: "0.3.1".into(), timestamp: None });
    }

    #[tokio::test]
    async fn test_request_correlates_reply() {
        let (handle, mut rx) = AgentHandle::new("h1", "1.0.0");
        let agent = handle.clone();
        tokio::spawn(async move {
            if let Some(KernelFrame::Exec { request_id, command, .. }) = rx.recv().await {
                agent.deliver(AgentFrame::Completed { request_id, stdout: command, stderr: String::new(), exit_code: 0 });
            }
            // garde le canal ouvert
            let _ = rx.recv().await;
        });

        let reply = handle.request("echo hi", Duration::from_secs(1), None).await.unwrap();
        assert!(matches!(reply, AgentFrame::Completed { ref stdout, .. } if stdout == "echo hi"));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_sends_cancel() {
        let (handle, mut rx) = AgentHandle::new("h1", "1.0.0");
        let err = handle.request("sleep 100", Duration::from_secs(2), None).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { transport: TransportKind::Agent, .. }));
        assert!(err.is_channel_failure());

        assert!(matches!(rx.recv().await, Some(KernelFrame::Exec { .. })));
        assert!(matches!(rx.recv().await, Some(KernelFrame::Cancel { .. })));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_handle_fails_pending_and_new_requests() {
        let (handle, rx) = AgentHandle::new("h1", "1.0.0");
        let waiting = {
            let h = handle.clone();
            tokio::spawn(async move { h.request("uptime", Duration::from_secs(5), None).await })
        };
        tokio::task::yield_now().await;
        handle.close();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_channel_failure());

        drop(rx);
        assert!(!handle.is_open());
        assert!(handle.open_stream("uptime", None).is_err());
    }

    #[tokio::test]
    async fn test_stream_receives_chunks_then_terminal() {
        let (handle, mut rx) = AgentHandle::new("h1", "1.0.0");
        let (request_id, mut frames) = handle.open_stream("tail -f log", None).unwrap();
        assert!(matches!(rx.recv().await, Some(KernelFrame::Exec { stream: true, .. })));

        handle.deliver(AgentFrame::Chunk { request_id: request_id.clone(), stream: StreamName::Stdout, data: "a".into() });
        handle.deliver(AgentFrame::Completed {
            request_id: request_id.clone(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 3,
        });

        assert!(matches!(frames.recv().await, Some(AgentFrame::Chunk { .. })));
        assert!(matches!(frames.recv().await, Some(AgentFrame::Completed { exit_code: 3, .. })));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_pong() {
        let (handle, mut rx) = AgentHandle::new("h1", "1.0.0");
        let agent = handle.clone();
        tokio::spawn(async move {
            if let Some(KernelFrame::Ping { nonce }) = rx.recv().await {
                agent.deliver(AgentFrame::Pong { nonce });
            }
            // deuxième ping : pas de réponse
            let _ = rx.recv().await;
            let _ = rx.recv().await;
        });
        assert!(handle.ping(Duration::from_secs(5)).await);
        assert!(!handle.ping(Duration::from_secs(5)).await);
    }
}
