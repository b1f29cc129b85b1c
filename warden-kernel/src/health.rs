/**
 * SANTÉ - État du kernel et suivi hors-ligne des agents avec auto-réparation
 *
 * RÔLE :
 * - `KernelHealth` : instantané du processus kernel (uptime, mémoire, parc)
 * - `HealthMonitor` : pour chaque hôte dont le canal agent est tombé, suivre
 *   depuis quand, et déclencher la réinstallation de l'agent à intervalles
 *   bornés, jusqu'à un nombre maximal de tentatives
 *
 * FONCTIONNEMENT :
 * - `check_health` est synchrone et ne bloque jamais sur une remédiation :
 *   la tentative part en tâche de fond, la réponse reflète l'état courant
 * - Canal vivant → suivi supprimé, statut "connected"
 * - Hors-ligne depuis ≥ seuil, tentatives < max, aucune en cours, et délai
 *   depuis la dernière tentative ≥ retry_delay → nouvelle tentative
 * - Au maximum : "exhausted", plus aucune tentative automatique jusqu'au
 *   reset opérateur
 * - Le suivi est local au processus : un redémarrage repart de zéro
 */

use crate::agents::ConnectionRegistry;
use crate::config::HealthConf;
use crate::errors::ExecError;
use crate::remediation::Remediator;
use crate::state::{new_host_table, HostTable};
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub hosts_registered: usize,
    pub agents_live: usize,
    pub hosts_offline_tracked: usize,
    pub memory_usage_mb: f32,
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub offline_threshold: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl From<&HealthConf> for HealthPolicy {
    fn from(conf: &HealthConf) -> Self {
        Self {
            offline_threshold: Duration::from_secs(conf.offline_threshold_secs),
            retry_delay: Duration::from_secs(conf.retry_delay_secs),
            max_attempts: conf.max_attempts,
        }
    }
}

/// Statut santé d'un hôte tel que renvoyé aux appelants
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostHealth {
    pub connected: bool,
    pub offline_duration_ms: u64,
    pub remediating: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub exhausted: bool,
}

#[derive(Debug, Clone)]
struct OfflineTrack {
    since: Instant,
    attempts: u32,
    last_attempt: Option<Instant>,
    in_flight: bool,
}

impl OfflineTrack {
    fn new(now: Instant) -> Self {
        Self { since: now, attempts: 0, last_attempt: None, in_flight: false }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<ConnectionRegistry>,
    remediator: Arc<dyn Remediator>,
    policy: HealthPolicy,
    tracks: HostTable<OfflineTrack>,
    started: std::time::Instant,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, remediator: Arc<dyn Remediator>, policy: HealthPolicy) -> Self {
        Self {
            registry,
            remediator,
            policy,
            tracks: new_host_table(),
            started: std::time::Instant::now(),
        }
    }

    fn connected_status(&self) -> HostHealth {
        HostHealth {
            connected: true,
            offline_duration_ms: 0,
            remediating: false,
            attempts: 0,
            max_attempts: self.policy.max_attempts,
            exhausted: false,
        }
    }

    fn status_of(&self, track: &OfflineTrack, now: Instant) -> HostHealth {
        let max = self.policy.max_attempts;
        HostHealth {
            connected: false,
            offline_duration_ms: now.duration_since(track.since).as_millis() as u64,
            remediating: track.attempts >= 1 && track.attempts < max,
            attempts: track.attempts,
            max_attempts: max,
            exhausted: track.attempts >= max,
        }
    }

    /// Évalue un hôte, déclenche au besoin une tentative de remédiation en arrière-plan
    pub fn check_health(&self, host: &str) -> HostHealth {
        if self.registry.is_live(host) {
            self.tracks.lock().remove(host);
            return self.connected_status();
        }

        let now = Instant::now();
        let (status, launch) = {
            let mut tracks = self.tracks.lock();
            let track = tracks.entry(host.to_string()).or_insert_with(|| OfflineTrack::new(now));
            let due = now.duration_since(track.since) >= self.policy.offline_threshold
                && track.attempts < self.policy.max_attempts
                && !track.in_flight
                && track
                    .last_attempt
                    .map_or(true, |at| now.duration_since(at) >= self.policy.retry_delay);
            if due {
                track.attempts += 1;
                track.last_attempt = Some(now);
                track.in_flight = true;
            }
            (self.status_of(track, now), due)
        };

        if launch {
            self.launch_attempt(host, status.attempts);
        }
        status
    }

    fn launch_attempt(&self, host: &str, attempt: u32) {
        info!(host = %host, attempt, max = self.policy.max_attempts, "agent offline, starting remediation");
        let monitor = self.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let result = monitor.remediator.remediate(&host).await;
            monitor.finish_attempt(&host, result);
        });
    }

    fn finish_attempt(&self, host: &str, result: Result<(), ExecError>) {
        let mut tracks = self.tracks.lock();
        match result {
            Ok(()) => {
                info!(host = %host, "remediation succeeded");
                tracks.remove(host);
            }
            Err(e) => {
                if let Some(track) = tracks.get_mut(host) {
                    track.in_flight = false;
                    if track.attempts >= self.policy.max_attempts {
                        error!(host = %host, attempts = track.attempts, error = %e, "remediation exhausted, operator action required");
                    } else {
                        warn!(host = %host, attempt = track.attempts, error = %e, "remediation attempt failed");
                    }
                }
            }
        }
    }

    /// Oublie le suivi d'un hôte (reset opérateur, ou hôte retiré)
    pub fn reset(&self, host: &str) -> bool {
        self.tracks.lock().remove(host).is_some()
    }

    /// Tentative manuelle immédiate, hors seuil et délai ; refusée si épuisé
    pub fn remediate_now(&self, host: &str) -> Result<HostHealth, ExecError> {
        if self.registry.is_live(host) {
            return Ok(self.connected_status());
        }

        let now = Instant::now();
        let (status, launch) = {
            let mut tracks = self.tracks.lock();
            let track = tracks.entry(host.to_string()).or_insert_with(|| OfflineTrack::new(now));
            if track.attempts >= self.policy.max_attempts {
                return Err(ExecError::RemediationExhausted { host: host.to_string(), attempts: track.attempts });
            }
            let launch = !track.in_flight;
            if launch {
                track.attempts += 1;
                track.last_attempt = Some(now);
                track.in_flight = true;
            }
            (self.status_of(track, now), launch)
        };

        if launch {
            self.launch_attempt(host, status.attempts);
        }
        Ok(status)
    }

    pub fn kernel_health(&self, hosts_registered: usize) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.started.elapsed().as_secs(),
            hosts_registered,
            agents_live: self.registry.live_count(),
            hosts_offline_tracked: self.tracks.lock().len(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    /// Balayage périodique : la remédiation ne dépend pas des appelants
    pub fn spawn_sweeper(&self, store: Store, every: Duration) {
        info!(interval_secs = every.as_secs(), "starting health sweeper");
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match store.list_hosts().await {
                    Ok(hosts) => {
                        monitor.tracks.lock().retain(|host, _| hosts.contains(host));
                        for host in &hosts {
                            monitor.check_health(host);
                        }
                    }
                    Err(e) => error!(error = %e, "health sweep could not list hosts"),
                }
            }
        });
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<u64>) {
                        return (kb as f32) / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}
