//! Cache de résultats à deux niveaux avec échéance de réponse.
//!
//! - niveau frais : servi directement tant qu'il n'a pas expiré
//! - niveau périmé : filet de sécurité quand la récupération dépasse l'échéance
//!
//! La récupération tourne dans une tâche détachée : si l'échéance tombe
//! avant elle, l'appelant reçoit la valeur périmée et la tâche termine
//! quand même, en rafraîchissant les deux niveaux pour le prochain appel.
//! Une récupération ne remplace jamais une valeur issue d'une récupération
//! lancée après elle.

use crate::config::CacheConf;
use crate::errors::ExecError;
use crate::state::{new_state, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    pub deadline: Duration,
}

impl From<&CacheConf> for CachePolicy {
    fn from(conf: &CacheConf) -> Self {
        Self {
            fresh_ttl: Duration::from_secs(conf.fresh_ttl_secs),
            stale_ttl: Duration::from_secs(conf.stale_ttl_secs),
            deadline: Duration::from_millis(conf.deadline_ms),
        }
    }
}

struct Slot<V> {
    value: V,
    expires: Instant,
    /// Début de la récupération qui a produit la valeur
    fetched_at: Instant,
}

struct Tiers<V> {
    fresh: Option<Slot<V>>,
    stale: Option<Slot<V>>,
}

#[derive(Clone)]
pub struct ResultCache<V> {
    entries: Shared<HashMap<String, Tiers<V>>>,
    policy: CachePolicy,
}

impl<V> ResultCache<V>
where
    V: Clone + Send + 'static,
{
    pub fn new(policy: CachePolicy) -> Self {
        Self { entries: new_state(HashMap::new()), policy }
    }

    fn fresh(&self, key: &str, now: Instant) -> Option<V> {
        let entries = self.entries.lock();
        let slot = entries.get(key)?.fresh.as_ref()?;
        (slot.expires > now).then(|| slot.value.clone())
    }

    fn stale(&self, key: &str, now: Instant) -> Option<V> {
        let entries = self.entries.lock();
        let slot = entries.get(key)?.stale.as_ref()?;
        (slot.expires > now).then(|| slot.value.clone())
    }

    fn store(&self, key: &str, value: V, policy: &CachePolicy, fetched_at: Instant) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, tiers| tiers.stale.as_ref().is_some_and(|slot| slot.expires > now));

        let newer = entries
            .get(key)
            .and_then(|tiers| tiers.stale.as_ref())
            .is_some_and(|slot| slot.fetched_at > fetched_at);
        if newer {
            debug!(key = %key, "late fetch result dropped, cache holds a newer value");
            return;
        }
        entries.insert(
            key.to_string(),
            Tiers {
                fresh: Some(Slot { value: value.clone(), expires: now + policy.fresh_ttl, fetched_at }),
                stale: Some(Slot { value, expires: now + policy.stale_ttl, fetched_at }),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<V, ExecError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ExecError>> + Send + 'static,
    {
        let policy = self.policy.clone();
        self.get_or_fetch_with(key, &policy, fetcher).await
    }

    /// Valeur fraîche, sinon récupération bornée par l'échéance, sinon valeur périmée
    pub async fn get_or_fetch_with<F, Fut>(&self, key: &str, policy: &CachePolicy, fetcher: F) -> Result<V, ExecError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ExecError>> + Send + 'static,
    {
        if let Some(value) = self.fresh(key, Instant::now()) {
            debug!(key = %key, "cache hit");
            return Ok(value);
        }

        let started = Instant::now();
        let fetch = fetcher();
        let cache = self.clone();
        let owned_key = key.to_string();
        let write_policy = policy.clone();
        let mut task = tokio::spawn(async move {
            let result = fetch.await;
            match &result {
                Ok(value) => cache.store(&owned_key, value.clone(), &write_policy, started),
                Err(e) => warn!(key = %owned_key, error = %e, "cache fetch failed"),
            }
            result
        });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(ExecError::Internal(format!("fetch task for {key} failed: {e}"))),
            },
            _ = tokio::time::sleep(policy.deadline) => {
                match self.stale(key, Instant::now()) {
                    Some(value) => {
                        debug!(key = %key, "fetch missed deadline, serving stale value");
                        Ok(value)
                    }
                    None => Err(ExecError::Deadline { key: key.to_string(), deadline: policy.deadline }),
                }
            }
        }
    }
}
