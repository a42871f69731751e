use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

use doorman_state::error::StateError;
use doorman_state::key::{KeyKind, StateKey};
use doorman_state::store::SharedStore;

/// Redis-backed implementation of [`SharedStore`].
///
/// Uses a `deadpool-redis` connection pool. Counters use `INCRBY`, TTLs use
/// `PEXPIRE`, so every mutation is atomic on the server side.
pub struct RedisSharedStore {
    pool: Pool,
    prefix: String,
}

impl std::fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisSharedStore {
    /// Create a new store from the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Connection`] if the pool cannot be created.
    pub fn new(config: &crate::RedisConfig) -> Result<Self, StateError> {
        let cfg = Config::from_url(config.url());
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StateError::Connection(e.to_string()))?
            .map_err(|e| StateError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.prefix.clone(),
        })
    }

    fn render_key(&self, key: &StateKey) -> String {
        format!("{}:{}", self.prefix, key.canonical())
    }

    fn render_prefix(&self, kind: &KeyKind, prefix: &str) -> String {
        format!("{}:{}:{}", self.prefix, kind, prefix)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StateError> {
        self.pool
            .get()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))
    }

    /// Collect all keys matching `pattern` via SCAN.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StateError> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;
        conn.get(&redis_key)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))
    }

    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;
        match ttl {
            Some(d) => {
                let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
                let () = conn
                    .pset_ex(&redis_key, value, ms)
                    .await
                    .map_err(|e| StateError::Backend(e.to_string()))?;
            }
            None => {
                let () = conn
                    .set(&redis_key, value)
                    .await
                    .map_err(|e| StateError::Backend(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(&redis_key)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &StateKey, delta: i64) -> Result<i64, StateError> {
        let redis_key = self.render_key(key);
        let mut conn = self.conn().await?;
        conn.incr(&redis_key, delta)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))
    }

    async fn expire(&self, key: &StateKey, ttl: Duration) -> Result<(), StateError> {
        let redis_key = self.render_key(key);
        let ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.conn().await?;
        // PEXPIRE on a missing key is a no-op server-side; the returned
        // flag is intentionally ignored.
        let _: i64 = conn
            .pexpire(&redis_key, ms)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn scan_prefix(
        &self,
        kind: KeyKind,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StateError> {
        let base = self.render_prefix(&kind, prefix);
        let pattern = format!("{base}*");
        let keys = self.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // The id starts after "{prefix}:{kind}:".
        let id_offset = format!("{}:{}:", self.prefix, kind).len();

        let mut conn = self.conn().await?;
        let values: Vec<Option<String>> = conn
            .mget(&keys)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;

        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key[id_offset..].to_owned(), v)))
            .collect())
    }

    async fn delete_prefix(&self, kind: KeyKind, prefix: &str) -> Result<u64, StateError> {
        let base = self.render_prefix(&kind, prefix);
        let pattern = format!("{base}*");
        let keys = self.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(&keys)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(u64::try_from(removed).unwrap_or(0))
    }
}
