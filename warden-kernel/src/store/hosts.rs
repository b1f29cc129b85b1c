use super::Store;
use crate::errors::StoreError;
use crate::models::unix_now;
use rusqlite::{params, OptionalExtension};

impl Store {
    /// Enregistre un hôte ; retourne false s'il existait déjà
    pub async fn add_host(&self, host: &str) -> Result<bool, StoreError> {
        let host = host.to_string();
        let inserted = self
            .conn()
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO hosts (id, added_at) VALUES (?1, ?2)",
                    params![host, unix_now()],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(inserted)
    }

    pub async fn host_exists(&self, host: &str) -> Result<bool, StoreError> {
        let host = host.to_string();
        let found = self
            .conn()
            .call(move |conn| {
                let row = conn
                    .query_row("SELECT 1 FROM hosts WHERE id = ?1", params![host], |_| Ok(()))
                    .optional()?;
                Ok(row.is_some())
            })
            .await?;
        Ok(found)
    }

    pub async fn list_hosts(&self) -> Result<Vec<String>, StoreError> {
        let hosts = self
            .conn()
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM hosts ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(hosts)
    }

    /// Supprime l'hôte et, explicitement, sa connexion agent et ses métriques
    pub async fn remove_host(&self, host: &str) -> Result<bool, StoreError> {
        let host = host.to_string();
        let removed = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM metric_samples WHERE host = ?1", params![host])?;
                tx.execute("DELETE FROM agent_connections WHERE host = ?1", params![host])?;
                let n = tx.execute("DELETE FROM hosts WHERE id = ?1", params![host])?;
                tx.commit()?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }
}
