use super::Store;
use crate::errors::StoreError;
use crate::models::MetricSample;
use crate::retention::plan_bucket_merges;
use rusqlite::{params, Row, Transaction};

const SAMPLE_COLUMNS: &str =
    "id, host, application, service, timestamp, cpu_usage, memory_usage, player_count, response_time, status";

/// Série identifiée par (host, application, service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesQuery {
    pub host: String,
    pub application: String,
    pub service: String,
}

impl SeriesQuery {
    pub fn new(host: &str, application: &str, service: &str) -> Self {
        Self { host: host.into(), application: application.into(), service: service.into() }
    }
}

/// Compteurs d'une fusion de tranche
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub series: usize,
    pub rows_merged: usize,
    pub buckets_written: usize,
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    Ok(MetricSample {
        id: row.get(0)?,
        host: row.get(1)?,
        application: row.get(2)?,
        service: row.get(3)?,
        timestamp: row.get(4)?,
        cpu_usage: row.get(5)?,
        memory_usage: row.get(6)?,
        player_count: row.get(7)?,
        response_time: row.get(8)?,
        status: row.get(9)?,
    })
}

fn insert_sample(tx: &Transaction<'_>, s: &MetricSample) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO metric_samples
         (host, application, service, timestamp, cpu_usage, memory_usage, player_count, response_time, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            s.host,
            s.application,
            s.service,
            s.timestamp,
            s.cpu_usage,
            s.memory_usage,
            s.player_count,
            s.response_time,
            s.status
        ],
    )?;
    Ok(())
}

fn series_rows(
    tx: &Transaction<'_>,
    series: &SeriesQuery,
    from: i64,
    to: i64,
) -> rusqlite::Result<Vec<MetricSample>> {
    let sql = format!(
        "SELECT {SAMPLE_COLUMNS} FROM metric_samples
         WHERE host = ?1 AND application = ?2 AND service = ?3 AND timestamp >= ?4 AND timestamp < ?5
         ORDER BY timestamp, id"
    );
    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt
        .query_map(params![series.host, series.application, series.service, from, to], sample_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl Store {
    pub async fn insert_samples(&self, samples: Vec<MetricSample>) -> Result<usize, StoreError> {
        let inserted = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for sample in &samples {
                    insert_sample(&tx, sample)?;
                }
                tx.commit()?;
                Ok(samples.len())
            })
            .await?;
        Ok(inserted)
    }

    /// Lignes d'une série dans [from, to), triées par temps
    pub async fn samples_in_range(
        &self,
        series: SeriesQuery,
        from: i64,
        to: i64,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let rows = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let rows = series_rows(&tx, &series, from, to)?;
                tx.commit()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Fusionne toutes les séries de [from, to) en buckets de `bucket_secs`.
    /// Une seule transaction : en cas d'erreur la tranche reste intacte.
    pub async fn merge_range(&self, from: i64, to: i64, bucket_secs: i64) -> Result<MergeCounts, StoreError> {
        let counts = self
            .conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let series = {
                    let mut stmt = tx.prepare(
                        "SELECT DISTINCT host, application, service FROM metric_samples
                         WHERE timestamp >= ?1 AND timestamp < ?2",
                    )?;
                    let rows = stmt
                        .query_map(params![from, to], |row| {
                            Ok(SeriesQuery { host: row.get(0)?, application: row.get(1)?, service: row.get(2)? })
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut counts = MergeCounts { series: series.len(), ..MergeCounts::default() };
                for s in &series {
                    let rows = series_rows(&tx, s, from, to)?;
                    for merge in plan_bucket_merges(&rows, bucket_secs) {
                        for id in &merge.replaced_ids {
                            tx.execute("DELETE FROM metric_samples WHERE id = ?1", params![id])?;
                        }
                        insert_sample(&tx, &merge.aggregate)?;
                        counts.rows_merged += merge.replaced_ids.len();
                        counts.buckets_written += 1;
                    }
                }
                tx.commit()?;
                Ok(counts)
            })
            .await?;
        Ok(counts)
    }

    /// Supprime les lignes strictement plus anciennes que `cutoff`
    pub async fn purge_samples_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        let purged = self
            .conn()
            .call(move |conn| {
                let n = conn.execute("DELETE FROM metric_samples WHERE timestamp < ?1", params![cutoff])?;
                Ok(n)
            })
            .await?;
        Ok(purged)
    }
}
