/**
 * STORE - Persistance relationnelle du kernel Warden (SQLite)
 *
 * RÔLE :
 * Registre durable des hôtes, table des connexions agents et table des
 * échantillons de télémétrie. Tout le reste (handles vivants, suivis
 * hors-ligne, cache) reste en mémoire.
 *
 * FONCTIONNEMENT :
 * - Une seule connexion `tokio_rusqlite` : toutes les requêtes sont
 *   sérialisées sur son thread, une transaction est donc atomique vis-à-vis
 *   des lecteurs
 * - Schéma créé au démarrage (idempotent)
 * - Sous-modules : hosts, agents, metrics
 */

mod agents;
mod hosts;
mod metrics;

pub use metrics::{MergeCounts, SeriesQuery};

use crate::errors::StoreError;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id        TEXT PRIMARY KEY,
    added_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_connections (
    host          TEXT PRIMARY KEY REFERENCES hosts(id),
    token         TEXT NOT NULL UNIQUE,
    status        TEXT NOT NULL DEFAULT 'disconnected',
    version       TEXT,
    connected_at  INTEGER,
    last_ping     INTEGER
);

CREATE TABLE IF NOT EXISTS metric_samples (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    host           TEXT NOT NULL,
    application    TEXT NOT NULL,
    service        TEXT NOT NULL,
    timestamp      INTEGER NOT NULL,
    cpu_usage      REAL,
    memory_usage   REAL,
    player_count   INTEGER,
    response_time  REAL,
    status         INTEGER
);

CREATE INDEX IF NOT EXISTS idx_metric_samples_timestamp
    ON metric_samples(timestamp);
CREATE INDEX IF NOT EXISTS idx_metric_samples_series
    ON metric_samples(host, application, service, timestamp);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Ouvre (ou crée) la base sur disque
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(&path).await?;
        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;
        let store = Self { conn };
        store.migrate().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Base éphémère pour les tests
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}
