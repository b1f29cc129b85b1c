//! One channel session with the kernel
//!
//! Sends `hello` first, then serves `exec`, `cancel` and `ping` frames until
//! the socket closes. Commands run in their own tasks; their frames are
//! funneled through a single writer.

use crate::config::AgentConfig;
use crate::execution::{CommandExecutor, ExecFailure};
use crate::protocol::{Incoming, Outgoing};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests still running, by id
type Running = HashMap<String, CancellationToken>;

pub async fn run_session(config: &AgentConfig, executor: Arc<CommandExecutor>) -> Result<()> {
    let (ws, _) = connect_async(config.channel_url().as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", config.kernel_url))?;
    info!("Connected to kernel at {} as {}", config.kernel_url, config.host);
    let (mut write, mut read) = ws.split();

    let hello = Outgoing::Hello {
        version: AgentConfig::version().to_string(),
        timestamp: Some(Utc::now().to_rfc3339()),
    };
    send(&mut write, &hello).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
    let mut running = Running::new();

    let result = loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(text.as_str(), &executor, &out_tx, &mut running),
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(anyhow::Error::new(e).context("Channel read failed")),
            },
            Some(frame) = out_rx.recv() => {
                if let Some(id) = frame.terminal_for() {
                    running.remove(id);
                }
                if let Err(e) = send(&mut write, &frame).await {
                    break Err(e);
                }
            }
        }
    };

    if !running.is_empty() {
        warn!("Session ended with {} command(s) running, cancelling", running.len());
    }
    for token in running.values() {
        token.cancel();
    }
    result
}

async fn send<S>(sink: &mut S, frame: &Outgoing) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let payload = serde_json::to_string(frame).context("Failed to serialize frame")?;
    sink.send(Message::text(payload)).await.context("Channel write failed")
}

fn handle_frame(text: &str, executor: &Arc<CommandExecutor>, out: &mpsc::UnboundedSender<Outgoing>, running: &mut Running) {
    let frame: Incoming = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring malformed frame: {}", e);
            return;
        }
    };

    match frame {
        Incoming::Ping { nonce } => {
            let _ = out.send(Outgoing::Pong { nonce });
        }
        Incoming::Cancel { request_id } => {
            if let Some(token) = running.remove(&request_id) {
                info!("Cancelling request {}", request_id);
                token.cancel();
            }
        }
        Incoming::Exec { request_id, command, timeout_ms, workdir, stream } => {
            let cancel = CancellationToken::new();
            running.insert(request_id.clone(), cancel.clone());
            let job = Job { request_id, command, timeout: Duration::from_millis(timeout_ms), workdir, stream };
            tokio::spawn(execute(executor.clone(), job, out.clone(), cancel));
        }
    }
}

struct Job {
    request_id: String,
    command: String,
    timeout: Duration,
    workdir: Option<String>,
    stream: bool,
}

fn failed(request_id: String, error: ExecFailure) -> Outgoing {
    Outgoing::Failed { request_id, error: error.to_string() }
}

async fn execute(executor: Arc<CommandExecutor>, job: Job, out: mpsc::UnboundedSender<Outgoing>, cancel: CancellationToken) {
    debug!("Request {}: {}", job.request_id, job.command);
    let Job { request_id, command, timeout, workdir, stream } = job;

    let frame = if stream {
        let chunks = out.clone();
        let id = request_id.clone();
        let result = executor
            .stream(&command, workdir.as_deref(), &cancel, |stream, data| {
                let _ = chunks.send(Outgoing::Chunk { request_id: id.clone(), stream, data });
            })
            .await;
        match result {
            Ok(exit_code) => Outgoing::Completed { request_id, stdout: String::new(), stderr: String::new(), exit_code },
            Err(e) => failed(request_id, e),
        }
    } else {
        match executor.run(&command, timeout, workdir.as_deref(), &cancel).await {
            Ok(output) => Outgoing::Completed {
                request_id,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
            },
            Err(e) => failed(request_id, e),
        }
    };
    let _ = out.send(frame);
}
