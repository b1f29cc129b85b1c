//! Transport agent : les commandes passent par le canal WebSocket ouvert
//! par l'agent résident de l'hôte.

use super::{OutputSink, Transport};
use crate::agents::ConnectionRegistry;
use crate::channel::AgentFrame;
use crate::errors::ExecError;
use crate::models::{ExecOutput, TransportKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct AgentTransport {
    registry: Arc<ConnectionRegistry>,
}

impl AgentTransport {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Transport for AgentTransport {
    async fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        let handle = self
            .registry
            .handle(host)
            .ok_or_else(|| ExecError::channel(host, "no live agent channel"))?;

        match handle.request(command, timeout, None).await? {
            AgentFrame::Completed { stdout, stderr, exit_code, .. } => {
                Ok(ExecOutput { stdout, stderr, exit_code, transport: TransportKind::Agent })
            }
            AgentFrame::Failed { error, .. } => Err(ExecError::channel(host, error)),
            other => Err(ExecError::channel(host, format!("unexpected reply: {other:?}"))),
        }
    }

    async fn stream(
        &self,
        host: &str,
        command: &str,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32, ExecError> {
        let handle = self
            .registry
            .handle(host)
            .ok_or_else(|| ExecError::channel(host, "no live agent channel"))?;
        let (request_id, mut frames) = handle.open_stream(command, None)?;

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(AgentFrame::Chunk { stream, data, .. }) => sink.on_chunk(stream, &data),
                    Some(AgentFrame::Completed { exit_code, .. }) => return Ok(exit_code),
                    Some(AgentFrame::Failed { error, .. }) => return Err(ExecError::channel(host, error)),
                    Some(_) => {}
                    None => return Err(ExecError::channel(host, "agent channel closed mid-stream")),
                },
                _ = cancel.cancelled() => {
                    debug!(host = %host, request_id = %request_id, "cancelling agent stream");
                    handle.cancel(&request_id);
                    return Err(ExecError::Cancelled { host: host.to_string() });
                }
            }
        }
    }
}
