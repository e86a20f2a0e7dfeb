use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use auditflow_core::AppResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Key/value cache port with expiring entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the raw value stored under `key`.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Stores a raw value with ttl.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    /// Returns whether `key` currently exists.
    async fn has(&self, key: &str) -> AppResult<bool>;

    /// Creates a marker key with ttl.
    async fn create_key(&self, key: &str, ttl: Duration) -> AppResult<()>;
}

/// Returns the cached value of `key`, or computes and caches it.
///
/// Cache read, decode and write failures are logged and never fail the call;
/// only `compute` errors are returned.
pub async fn remember<T, F, Fut>(
    cache: &dyn CacheStore,
    key: &str,
    ttl: Duration,
    compute: F,
) -> AppResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str::<T>(raw.as_str()) {
            Ok(value) => return Ok(value),
            Err(error) => warn!(cache_key = key, error = %error, "discarding unreadable cache entry"),
        },
        Ok(None) => {}
        Err(error) => warn!(cache_key = key, error = %error, "cache read failed"),
    }

    let value = compute().await?;

    match serde_json::to_string(&value) {
        Ok(raw) => {
            if let Err(error) = cache.set(key, raw.as_str(), ttl).await {
                warn!(cache_key = key, error = %error, "cache write failed");
            }
        }
        Err(error) => warn!(cache_key = key, error = %error, "failed to encode cache entry"),
    }

    Ok(value)
}
