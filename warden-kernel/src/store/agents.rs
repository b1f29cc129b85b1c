use super::Store;
use crate::errors::StoreError;
use crate::models::{AgentConnection, AgentStatus};
use rusqlite::{params, OptionalExtension, Row};

const AGENT_COLUMNS: &str = "host, token, status, version, connected_at, last_ping";

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentConnection> {
    let status: String = row.get(2)?;
    Ok(AgentConnection {
        host: row.get(0)?,
        token: row.get(1)?,
        status: AgentStatus::parse(&status),
        version: row.get(3)?,
        connected_at: row.get(4)?,
        last_ping: row.get(5)?,
    })
}

impl Store {
    pub async fn get_agent(&self, host: &str) -> Result<Option<AgentConnection>, StoreError> {
        let host = host.to_string();
        let agent = self
            .conn()
            .call(move |conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agent_connections WHERE host = ?1");
                let agent = conn.query_row(&sql, params![host], agent_from_row).optional()?;
                Ok(agent)
            })
            .await?;
        Ok(agent)
    }

    pub async fn agent_by_token(&self, token: &str) -> Result<Option<AgentConnection>, StoreError> {
        let token = token.to_string();
        let agent = self
            .conn()
            .call(move |conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agent_connections WHERE token = ?1");
                let agent = conn.query_row(&sql, params![token], agent_from_row).optional()?;
                Ok(agent)
            })
            .await?;
        Ok(agent)
    }

    /// Crée la ligne agent ou remplace son token (le statut est conservé)
    pub async fn upsert_agent_token(&self, host: &str, token: &str) -> Result<(), StoreError> {
        let (host, token) = (host.to_string(), token.to_string());
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_connections (host, token, status) VALUES (?1, ?2, 'disconnected')
                     ON CONFLICT(host) DO UPDATE SET token = excluded.token",
                    params![host, token],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_agent_connected(&self, host: &str, version: &str, at: i64) -> Result<(), StoreError> {
        let (host, version) = (host.to_string(), version.to_string());
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_connections
                     SET status = 'connected', version = ?2, connected_at = ?3, last_ping = ?3
                     WHERE host = ?1",
                    params![host, version, at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_agent_disconnected(&self, host: &str) -> Result<(), StoreError> {
        let host = host.to_string();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_connections SET status = 'disconnected' WHERE host = ?1",
                    params![host],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn touch_agent_ping(&self, host: &str, at: i64) -> Result<(), StoreError> {
        let host = host.to_string();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE agent_connections SET last_ping = ?2 WHERE host = ?1",
                    params![host, at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_agent(&self, host: &str) -> Result<bool, StoreError> {
        let host = host.to_string();
        let removed = self
            .conn()
            .call(move |conn| {
                let n = conn.execute("DELETE FROM agent_connections WHERE host = ?1", params![host])?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }
}
