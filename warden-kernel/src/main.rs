/**
 * WARDEN KERNEL - Point d'entrée principal du serveur Warden
 *
 * RÔLE : Orchestration de tous les modules : config, stockage, transports,
 * registre des agents, santé, cache, rétention, HTTP.
 *
 * ARCHITECTURE : canal agent WebSocket + repli ssh, derrière une API REST ;
 * tâches de fond pour la vivacité des agents, la remédiation et la rétention.
 * UTILITÉ : point unique "exécuter sur l'hôte X" pour tout le panel.
 */

mod agents;
mod cache;
mod channel;
mod config;
mod dispatch;
mod errors;
mod health;
mod http;
mod installer;
mod models;
mod remediation;
mod retention;
mod services;
mod state;
mod store;
mod transport;

#[cfg(test)]
mod test_support;

use crate::agents::ConnectionRegistry;
use crate::cache::{CachePolicy, ResultCache};
use crate::config::load_config;
use crate::dispatch::Dispatcher;
use crate::health::{HealthMonitor, HealthPolicy};
use crate::http::AppState;
use crate::remediation::AgentReinstaller;
use crate::retention::{RetentionPolicy, RetentionTask};
use crate::services::ServiceDirectory;
use crate::store::Store;
use crate::transport::{AgentTransport, ShellOptions, ShellTransport, Transport};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden_kernel=info")))
        .init();

    let cfg = Arc::new(load_config().await);

    let store = Store::open(&cfg.database)
        .await
        .with_context(|| format!("failed to open database {}", cfg.database))?;
    info!(path = %cfg.database, "database ready");

    // transports et registre
    let shell: Arc<dyn Transport> = Arc::new(ShellTransport::new(ShellOptions::from(cfg.as_ref())));
    let registry = Arc::new(ConnectionRegistry::new(
        store.clone(),
        shell.clone(),
        &cfg.panel_address,
        Duration::from_secs(cfg.exec.install_timeout_secs),
    ));
    let agent: Arc<dyn Transport> = Arc::new(AgentTransport::new(registry.clone()));
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry.clone(), agent, shell.clone(), cfg.exec.timeout()));

    // santé et remédiation
    let remediator = Arc::new(AgentReinstaller::new(
        shell.clone(),
        registry.clone(),
        cfg.exec.timeout(),
        Duration::from_secs(cfg.exec.install_timeout_secs),
    ));
    let health = HealthMonitor::new(registry.clone(), remediator, HealthPolicy::from(&cfg.health));

    // inventaire des services derrière le cache
    let cache = ResultCache::new(CachePolicy::from(&cfg.cache));
    let services = Arc::new(ServiceDirectory::new(store.clone(), dispatcher.clone(), cache, &cfg.services.query_command));

    // tâches de fond
    channel::spawn_liveness_pinger(
        registry.clone(),
        Duration::from_secs(cfg.exec.ping_interval_secs.max(1)),
        Duration::from_secs(cfg.exec.ping_timeout_secs),
    );
    health.spawn_sweeper(store.clone(), Duration::from_secs(cfg.health.sweep_interval_secs.max(1)));
    Arc::new(RetentionTask::new(store.clone(), RetentionPolicy::from(&cfg.retention))).spawn();

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        store,
        registry,
        dispatcher,
        health,
        services,
        config: cfg.clone(),
        api_key: std::env::var("WARDEN_API_KEY").ok(),
    };

    // HTTP
    let app = http::build_router(app_state);
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!(addr = %cfg.listen, "kernel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server failed")?;
    Ok(())
}
