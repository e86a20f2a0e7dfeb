use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use auditflow_application::CacheStore;
use auditflow_core::AppResult;
use tokio::sync::RwLock;

const DEFAULT_PURGE_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory cache store with per-entry expiry.
///
/// Every `purge_every`-th write also sweeps expired entries, so keys that are
/// never read again do not accumulate.
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    writes: AtomicU64,
    purge_every: u64,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::with_purge_every(DEFAULT_PURGE_EVERY)
    }
}

impl InMemoryCacheStore {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache sweeping expired entries every `writes` writes.
    #[must_use]
    pub fn with_purge_every(writes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            purge_every: writes.max(1),
        }
    }

    /// Drops every expired entry and returns how many remain.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        retain_live(&mut entries, Instant::now());
        entries.len()
    }

    /// Returns the number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn retain_live(entries: &mut HashMap<String, CacheEntry>, now: Instant) {
    entries.retain(|_, entry| entry.expires_at > now);
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            entries.remove(key);
        }

        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or(now);

        let mut entries = self.entries.write().await;
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % self.purge_every == 0 {
            retain_live(&mut entries, now);
        }
        entries.insert(
            key.to_owned(),
            CacheEntry {
                value: value.to_owned(),
                expires_at,
            },
        );

        Ok(())
    }

    async fn has(&self, key: &str) -> AppResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn create_key(&self, key: &str, ttl: Duration) -> AppResult<()> {
        self.set(key, "1", ttl).await
    }
}
