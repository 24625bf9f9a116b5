use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{Jwk, JwkSet};
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedKeys {
    set: JwkSet,
    fetched_at: DateTime<Utc>,
}

/// Provider signing keys shared across requests, with fetch-time tracking.
#[derive(Debug, Clone, Default)]
pub struct KeyCache {
    inner: Arc<RwLock<Option<CachedKeys>>>,
    // Serialises refreshes; holds the time of the last fetch attempt.
    refresh: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key by `kid` in the current set.
    pub async fn find(&self, kid: &str) -> Option<Jwk> {
        let guard = self.inner.read().await;
        guard.as_ref().and_then(|cached| cached.set.find(kid).cloned())
    }

    /// Replace the whole set and record the fetch time.
    pub async fn store(&self, set: JwkSet) {
        let count = set.keys.len();
        let mut guard = self.inner.write().await;
        *guard = Some(CachedKeys {
            set,
            fetched_at: Utc::now(),
        });
        debug!(keys = count, "Signing keys stored");
    }

    pub async fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.as_ref().map(|c| c.fetched_at)
    }

    /// Seconds since the last fetch, `None` when nothing was fetched yet.
    pub async fn age_seconds(&self) -> Option<u64> {
        self.fetched_at()
            .await
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Take the refresh slot. Callers re-check staleness once they hold it,
    /// since another caller may have refreshed while they waited.
    pub async fn begin_refresh(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.refresh.lock().await
    }

    pub async fn is_stale(&self, max_age_secs: u64) -> bool {
        match self.age_seconds().await {
            Some(age) => age >= max_age_secs,
            None => true,
        }
    }
}
