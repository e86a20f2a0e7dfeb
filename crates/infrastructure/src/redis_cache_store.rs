//! Redis-backed cache store.

use std::time::Duration;

use async_trait::async_trait;
use auditflow_application::CacheStore;
use auditflow_core::{AppError, AppResult};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

/// Redis implementation of the cache store port.
#[derive(Clone)]
pub struct RedisCacheStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisCacheStore {
    /// Creates a cache adapter with a configured Redis client and key prefix.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    fn key_for(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{key}", self.key_prefix)
        }
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Unavailable(format!("failed to connect to redis: {error}")))
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut connection = self.connection().await?;

        connection
            .get(self.key_for(key))
            .await
            .map_err(|error| AppError::Internal(format!("failed to read cache entry '{key}': {error}")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut connection = self.connection().await?;

        connection
            .set_ex(self.key_for(key), value, ttl_seconds(ttl))
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to write cache entry '{key}': {error}"))
            })
    }

    async fn has(&self, key: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;

        connection
            .exists(self.key_for(key))
            .await
            .map_err(|error| AppError::Internal(format!("failed to probe cache key '{key}': {error}")))
    }

    async fn create_key(&self, key: &str, ttl: Duration) -> AppResult<()> {
        self.set(key, "1", ttl).await
    }
}
