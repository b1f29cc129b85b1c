//! Warden Agent - host-resident executor for the Warden kernel
//!
//! Keeps a persistent WebSocket channel to the kernel and runs the shell
//! commands it sends:
//! - Buffered and streamed execution with cancellation
//! - Ping/pong liveness
//! - Reconnect with exponential backoff

mod config;
mod execution;
mod protocol;
mod session;

use anyhow::{Context, Result};
use config::AgentConfig;
use execution::CommandExecutor;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden_agent=info")))
        .init();

    info!("Warden Agent v{} starting...", AgentConfig::version());

    let config = AgentConfig::load().await.context("Failed to load agent configuration")?;
    let executor = Arc::new(CommandExecutor::new(config.max_output_bytes));

    let mut delay = config.reconnect.min();
    loop {
        tokio::select! {
            result = session::run_session(&config, executor.clone()) => match result {
                Ok(()) => {
                    info!("Channel closed by kernel");
                    delay = config.reconnect.min();
                }
                Err(e) => {
                    error!("Channel failed: {:#}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                return Ok(());
            }
        }

        warn!("Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = config.reconnect.next(delay);
    }
}
