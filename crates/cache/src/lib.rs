//! Key-prefixed, TTL-bounded cache fronting the config store.
//!
//! Reads are cache-aside: on a miss the caller queries the facade and
//! populates the prefix. Writes on the admin surface invalidate first and
//! let the next read refill — the cache never writes to the store.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use doorman_state::{KeyKind, SharedStore, StateError, StateKey};

/// The named cache prefixes. Every cached entity lives under exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePrefix {
    /// `api_path -> Api` (keyed `{name}/{version}`).
    Api,
    /// `/{name}/{version} -> api_id`.
    ApiId,
    /// `METHOD:/{name}/{version}{uri} -> Endpoint`.
    Endpoint,
    /// `endpoint_id -> ValidationSchema`.
    EndpointValidation,
    Group,
    Role,
    User,
    UserGroup,
    UserRole,
    UserSubscription,
    /// `api_id -> server list` override.
    EndpointServer,
    /// `api_id -> round-robin cursor`.
    EndpointLoadBalancer,
    /// `client_key -> Routing`.
    ClientRouting,
    /// `api_credit_group -> CreditDefinition`.
    CreditDef,
    /// `api_id -> fetched OpenAPI document`.
    Openapi,
    /// `wsdl_url -> parsed WSDL`.
    Wsdl,
}

/// Default TTL applied when a prefix has no override.
pub const DEFAULT_TTL_SECS: u64 = 86_400;

impl CachePrefix {
    /// The stable name used in rendered keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api_cache",
            Self::ApiId => "api_id_cache",
            Self::Endpoint => "endpoint_cache",
            Self::EndpointValidation => "endpoint_validation_cache",
            Self::Group => "group_cache",
            Self::Role => "role_cache",
            Self::User => "user_cache",
            Self::UserGroup => "user_group_cache",
            Self::UserRole => "user_role_cache",
            Self::UserSubscription => "user_subscription_cache",
            Self::EndpointServer => "endpoint_server_cache",
            Self::EndpointLoadBalancer => "endpoint_load_balancer",
            Self::ClientRouting => "client_routing_cache",
            Self::CreditDef => "credit_def_cache",
            Self::Openapi => "openapi_cache",
            Self::Wsdl => "wsdl_cache",
        }
    }

    /// Per-prefix default TTL.
    #[must_use]
    pub fn default_ttl(self) -> Duration {
        let secs = match self {
            // The load-balancer cursor is mutated constantly; a short TTL
            // keeps a stale cursor from pinning one server after a config
            // change.
            Self::EndpointLoadBalancer => 3_600,
            // Remote documents re-fetch daily like everything else.
            _ => DEFAULT_TTL_SECS,
        };
        Duration::from_secs(secs)
    }

    /// All prefixes, for `clear_all` and diagnostics.
    #[must_use]
    pub fn all() -> &'static [CachePrefix] {
        &[
            Self::Api,
            Self::ApiId,
            Self::Endpoint,
            Self::EndpointValidation,
            Self::Group,
            Self::Role,
            Self::User,
            Self::UserGroup,
            Self::UserRole,
            Self::UserSubscription,
            Self::EndpointServer,
            Self::EndpointLoadBalancer,
            Self::ClientRouting,
            Self::CreditDef,
            Self::Openapi,
            Self::Wsdl,
        ]
    }
}

impl std::fmt::Display for CachePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache failures. Backend errors are surfaced, not swallowed: the
/// orchestrator decides whether a degraded cache is fatal for the request.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] StateError),

    #[error("cache value encode/decode failed: {0}")]
    Codec(String),
}

/// The cache manager: prefix-scoped typed access over a [`SharedStore`].
pub struct CacheManager {
    store: Arc<dyn SharedStore>,
    ttl_override: Option<Duration>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager").finish_non_exhaustive()
    }
}

impl CacheManager {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            ttl_override: None,
        }
    }

    /// Override every prefix TTL (used by tests and the hot-reload path).
    #[must_use]
    pub fn with_ttl(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl_override: Some(ttl),
        }
    }

    fn state_key(prefix: CachePrefix, key: &str) -> StateKey {
        StateKey::new(KeyKind::Cache, format!("{}:{}", prefix.as_str(), key))
    }

    fn ttl_for(&self, prefix: CachePrefix) -> Duration {
        self.ttl_override.unwrap_or_else(|| prefix.default_ttl())
    }

    /// Typed get. Returns `None` on a miss or expired entry.
    pub async fn get<T: DeserializeOwned>(
        &self,
        prefix: CachePrefix,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let raw = self.store.get(&Self::state_key(prefix, key)).await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    /// Typed set with the prefix's TTL.
    pub async fn set<T: Serialize>(
        &self,
        prefix: CachePrefix,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(value).map_err(|e| CacheError::Codec(e.to_string()))?;
        self.store
            .set(&Self::state_key(prefix, key), &json, Some(self.ttl_for(prefix)))
            .await?;
        Ok(())
    }

    /// Store a binary value, base64-normalized before JSON encoding.
    pub async fn set_bytes(
        &self,
        prefix: CachePrefix,
        key: &str,
        value: &[u8],
    ) -> Result<(), CacheError> {
        self.set(prefix, key, &B64.encode(value)).await
    }

    /// Fetch a binary value stored by [`set_bytes`](Self::set_bytes).
    pub async fn get_bytes(
        &self,
        prefix: CachePrefix,
        key: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let encoded: Option<String> = self.get(prefix, key).await?;
        match encoded {
            Some(b64) => B64
                .decode(b64)
                .map(Some)
                .map_err(|e| CacheError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, prefix: CachePrefix, key: &str) -> Result<(), CacheError> {
        self.store.delete(&Self::state_key(prefix, key)).await?;
        Ok(())
    }

    /// Drop every entry under one prefix.
    pub async fn clear_prefix(&self, prefix: CachePrefix) -> Result<u64, CacheError> {
        Ok(self
            .store
            .delete_prefix(KeyKind::Cache, &format!("{}:", prefix.as_str()))
            .await?)
    }

    /// Drop every cached entry.
    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        let mut total = 0;
        for prefix in CachePrefix::all() {
            total += self.clear_prefix(*prefix).await?;
        }
        Ok(total)
    }

    /// Round-trip a sentinel through the backend.
    pub async fn health_check(&self) -> Result<(), CacheError> {
        Ok(self.store.health_check().await?)
    }

    /// Atomically advance the round-robin cursor for an API.
    pub async fn next_balancer_index(&self, api_id: &str) -> Result<i64, CacheError> {
        let key = StateKey::new(
            KeyKind::LoadBalancer,
            format!("{}:{}", CachePrefix::EndpointLoadBalancer.as_str(), api_id),
        );
        let value = self.store.incr(&key, 1).await?;
        self.store
            .expire(&key, CachePrefix::EndpointLoadBalancer.default_ttl())
            .await?;
        Ok(value)
    }

    // -- entity invalidation ------------------------------------------------
    //
    // Every admin write invalidates the primary key and any derived index
    // keys for the entity, so the next gateway read refills from the store.

    /// Invalidate an API by `(name, version)` and its id mapping.
    pub async fn invalidate_api(&self, name: &str, version: &str) -> Result<(), CacheError> {
        self.delete(CachePrefix::Api, &format!("{name}/{version}"))
            .await?;
        self.delete(CachePrefix::ApiId, &format!("/{name}/{version}"))
            .await?;
        Ok(())
    }

    /// Invalidate one endpoint and the API's derived server/balancer keys.
    pub async fn invalidate_endpoint(
        &self,
        api_id: &str,
        composite_key: &str,
    ) -> Result<(), CacheError> {
        self.delete(CachePrefix::Endpoint, composite_key).await?;
        self.delete(CachePrefix::EndpointServer, api_id).await?;
        self.delete(CachePrefix::EndpointLoadBalancer, api_id).await?;
        Ok(())
    }

    /// Invalidate a user and every user-derived lookup.
    pub async fn invalidate_user(&self, username: &str) -> Result<(), CacheError> {
        self.delete(CachePrefix::User, username).await?;
        self.delete(CachePrefix::UserGroup, username).await?;
        self.delete(CachePrefix::UserRole, username).await?;
        self.delete(CachePrefix::UserSubscription, username).await?;
        Ok(())
    }

    pub async fn invalidate_credit_def(&self, group: &str) -> Result<(), CacheError> {
        self.delete(CachePrefix::CreditDef, group).await
    }

    pub async fn invalidate_routing(&self, client_key: &str) -> Result<(), CacheError> {
        self.delete(CachePrefix::ClientRouting, client_key).await
    }
}
