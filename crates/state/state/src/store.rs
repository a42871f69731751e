use std::time::Duration;

use async_trait::async_trait;

use crate::error::StateError;
use crate::key::{KeyKind, StateKey};

/// Trait for the fast shared state behind caches, counters, and blacklists.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
/// All counter mutations go through [`incr`](SharedStore::incr) — callers
/// never read-modify-write.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Get the value for a key. Returns `None` if not found or expired.
    async fn get(&self, key: &StateKey) -> Result<Option<String>, StateError>;

    /// Set a value with an optional TTL, overwriting any previous value.
    async fn set(
        &self,
        key: &StateKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StateError>;

    /// Delete a key. Returns `true` if the key existed.
    async fn delete(&self, key: &StateKey) -> Result<bool, StateError>;

    /// Atomically increment a counter by `delta`. Returns the new value.
    /// Creates the counter at 0 if it doesn't exist before incrementing.
    /// An existing TTL is left untouched.
    async fn incr(&self, key: &StateKey, delta: i64) -> Result<i64, StateError>;

    /// Set or refresh the TTL on an existing key. A missing key is a no-op.
    async fn expire(&self, key: &StateKey, ttl: Duration) -> Result<(), StateError>;

    /// Scan live keys of `kind` whose id starts with `prefix`.
    ///
    /// Returns `(id, value)` pairs. May be expensive on some backends;
    /// reserved for cache invalidation and diagnostics, never the hot path.
    async fn scan_prefix(
        &self,
        kind: KeyKind,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StateError>;

    /// Delete all keys of `kind` whose id starts with `prefix`. Returns the
    /// number of keys removed.
    async fn delete_prefix(&self, kind: KeyKind, prefix: &str) -> Result<u64, StateError>;

    /// Round-trip a sentinel value to prove the backend is reachable.
    async fn health_check(&self) -> Result<(), StateError> {
        let key = StateKey::new(KeyKind::Custom("health".into()), "sentinel");
        self.set(&key, "ok", Some(Duration::from_secs(10))).await?;
        match self.get(&key).await? {
            Some(v) if v == "ok" => Ok(()),
            other => Err(StateError::Backend(format!(
                "health sentinel mismatch: {other:?}"
            ))),
        }
    }
}
