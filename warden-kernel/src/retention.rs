/**
 * RÉTENTION TÉLÉMÉTRIE - Sous-échantillonnage périodique de `metric_samples`
 *
 * RÔLE :
 * Borner la croissance de la table de télémétrie : plus une ligne vieillit,
 * plus son bucket de fusion est large ; au-delà de l'âge maximum elle est
 * supprimée.
 *
 * FONCTIONNEMENT :
 * - Tranches d'âge décroissantes (1j-7j → 5 min, 7j-30j → 1 h, 30j-1an → 1 j)
 * - Par tranche et par série (host, application, service) : regroupement par
 *   timestamp / largeur, moyenne des champs numériques pour tout bucket de
 *   plus d'une ligne, ligne agrégée datée du début du bucket
 * - Une transaction par tranche (voir `Store::merge_range`)
 * - Une seule exécution à la fois ; les lectures ordinaires ne sont pas bloquées
 */

use crate::config::{BandConf, RetentionConf};
use crate::models::{unix_now, MetricSample};
use crate::store::{MergeCounts, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Remplacement de plusieurs lignes d'un bucket par une ligne agrégée
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BucketMerge {
    pub replaced_ids: Vec<i64>,
    pub aggregate: MetricSample,
}

/// Planifie les fusions d'une série triée par temps.
/// Les buckets d'une seule ligne sont laissés tels quels.
pub(crate) fn plan_bucket_merges(rows: &[MetricSample], bucket_secs: i64) -> Vec<BucketMerge> {
    if bucket_secs <= 0 {
        return Vec::new();
    }
    let mut buckets: BTreeMap<i64, Vec<&MetricSample>> = BTreeMap::new();
    for row in rows {
        buckets.entry(row.timestamp.div_euclid(bucket_secs)).or_default().push(row);
    }

    buckets
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(index, members)| BucketMerge {
            replaced_ids: members.iter().filter_map(|r| r.id).collect(),
            aggregate: aggregate_bucket(index * bucket_secs, &members),
        })
        .collect()
}

fn aggregate_bucket(bucket_start: i64, members: &[&MetricSample]) -> MetricSample {
    let first = members[0];
    MetricSample {
        id: None,
        host: first.host.clone(),
        application: first.application.clone(),
        service: first.service.clone(),
        timestamp: bucket_start,
        cpu_usage: mean(members.iter().map(|m| m.cpu_usage)),
        memory_usage: mean(members.iter().map(|m| m.memory_usage)),
        player_count: mean(members.iter().map(|m| m.player_count.map(|v| v as f64))).map(round_count),
        response_time: mean(members.iter().map(|m| m.response_time)),
        status: mean(members.iter().map(|m| m.status.map(|v| v as f64))).map(round_count),
    }
}

/// Moyenne arithmétique des valeurs présentes ; None si aucune
fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = values.flatten().fold((0.0, 0u32), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / f64::from(count))
}

fn round_count(v: f64) -> i64 {
    v.round() as i64
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub bands: Vec<BandConf>,
    pub max_age_secs: i64,
    pub interval: Duration,
}

impl From<&RetentionConf> for RetentionPolicy {
    fn from(conf: &RetentionConf) -> Self {
        Self {
            bands: conf.bands.clone(),
            max_age_secs: (conf.max_age_days as i64) * 86_400,
            interval: Duration::from_secs(conf.interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RetentionReport {
    pub merged: Vec<(BandConf, MergeCounts)>,
    pub failed_bands: usize,
    pub purged: usize,
}

pub struct RetentionTask {
    store: Store,
    policy: RetentionPolicy,
    running: Mutex<()>,
}

impl RetentionTask {
    pub fn new(store: Store, policy: RetentionPolicy) -> Self {
        Self { store, policy, running: Mutex::new(()) }
    }

    /// Une passe complète. `None` si une autre passe est déjà en cours.
    pub async fn run_once(&self, now: i64) -> Option<RetentionReport> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("retention pass already running, skipping");
            return None;
        };

        let mut report = RetentionReport::default();
        for band in &self.policy.bands {
            let from = now - band.max_age_secs;
            let to = now - band.min_age_secs;
            match self.store.merge_range(from, to, band.bucket_secs).await {
                Ok(counts) => {
                    info!(
                        bucket_secs = band.bucket_secs,
                        series = counts.series,
                        rows_merged = counts.rows_merged,
                        buckets_written = counts.buckets_written,
                        "retention band merged"
                    );
                    report.merged.push((band.clone(), counts));
                }
                Err(e) => {
                    error!(bucket_secs = band.bucket_secs, error = %e, "retention band rolled back");
                    report.failed_bands += 1;
                }
            }
        }

        match self.store.purge_samples_before(now - self.policy.max_age_secs).await {
            Ok(purged) => {
                report.purged = purged;
                info!(rows_deleted = purged, "retention purge done");
            }
            Err(e) => error!(error = %e, "retention purge failed"),
        }
        Some(report)
    }

    /// Planificateur : une passe par intervalle, les échecs sont retentés au tick suivant
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(interval_secs = self.policy.interval.as_secs(), "starting retention scheduler");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.interval);
            loop {
                interval.tick().await;
                self.run_once(unix_now()).await;
            }
        })
    }
}
