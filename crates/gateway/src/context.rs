//! The application context.
//!
//! Everything the pipeline touches — store, cache, counters, token
//! service, metrics, breakers — is constructed once at process init and
//! passed explicitly. Tests build a fresh context per case; nothing here
//! is global.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use doorman_auth::{TokenBlacklist, TokenService};
use doorman_cache::CacheManager;
use doorman_crypto::{MasterKey, SecretCipher};
use doorman_state::SharedStore;
use doorman_store::ConfigStore;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::credits::CreditService;
use crate::geo::{CountryResolver, NoGeoResolver};
use crate::metrics::{DEFAULT_RESERVOIR_SIZE, MetricsStore};
use crate::proto::DescriptorRegistry;
use crate::quota::QuotaTracker;
use crate::ratelimit::RateLimiter;

/// Gateway tuning. The whole struct is hot-reloadable except where noted
/// by the server's reload handler.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-attempt upstream timeout.
    pub request_timeout: Duration,
    /// Exponential backoff base between retries.
    pub backoff_base: Duration,
    /// Wrap every response as `{status_code, ...}` with HTTP 200.
    pub strict_envelope: bool,
    /// Resolve gRPC descriptors via server reflection when no artifact
    /// exists.
    pub grpc_reflection_enabled: bool,
    /// Directory holding compiled `.desc` artifacts.
    pub proto_dir: PathBuf,
    /// Pre-auth IP limit: requests per window.
    pub ip_rate_limit: u64,
    pub ip_rate_window_secs: u64,
    pub ip_rate_disabled: bool,
    pub circuit: CircuitBreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(200),
            strict_envelope: false,
            grpc_reflection_enabled: false,
            proto_dir: PathBuf::from("generated/proto"),
            ip_rate_limit: 10,
            ip_rate_window_secs: 60,
            ip_rate_disabled: false,
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// Shared application state for the gateway plane.
pub struct GatewayContext {
    pub store: Arc<dyn ConfigStore>,
    pub shared: Arc<dyn SharedStore>,
    pub cache: CacheManager,
    pub tokens: TokenService,
    pub blacklist: TokenBlacklist,
    pub limiter: RateLimiter,
    pub quotas: QuotaTracker,
    pub credits: CreditService,
    pub cipher: Arc<SecretCipher>,
    pub metrics: Arc<MetricsStore>,
    pub audit: Arc<dyn AuditSink>,
    pub circuits: CircuitBreakerRegistry,
    pub geo: Arc<dyn CountryResolver>,
    pub http: reqwest::Client,
    pub protos: DescriptorRegistry,
    config: RwLock<GatewayConfig>,
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("config", &*self.config.read())
            .finish_non_exhaustive()
    }
}

impl GatewayContext {
    /// Wire up a context from its backends. `metrics_samples` bounds the
    /// per-bucket latency reservoir (`METRICS_PCT_SAMPLES`).
    pub fn new(
        store: Arc<dyn ConfigStore>,
        shared: Arc<dyn SharedStore>,
        master_key: MasterKey,
        jwt_secret: &str,
        access_minutes: u64,
        refresh_days: u64,
        metrics_samples: Option<usize>,
        config: GatewayConfig,
    ) -> Self {
        let cipher = Arc::new(SecretCipher::new(master_key));
        let proto_dir = config.proto_dir.clone();
        let circuit = config.circuit.clone();
        Self {
            cache: CacheManager::new(shared.clone()),
            tokens: TokenService::new(jwt_secret, access_minutes, refresh_days),
            blacklist: TokenBlacklist::new(shared.clone()),
            limiter: RateLimiter::new(shared.clone()),
            quotas: QuotaTracker::new(shared.clone()),
            credits: CreditService::new(store.clone(), cipher.clone()),
            metrics: Arc::new(MetricsStore::new(
                metrics_samples.unwrap_or(DEFAULT_RESERVOIR_SIZE),
            )),
            audit: Arc::new(TracingAuditSink),
            circuits: CircuitBreakerRegistry::new(circuit),
            geo: Arc::new(NoGeoResolver),
            http: reqwest::Client::new(),
            protos: DescriptorRegistry::new(proto_dir),
            cipher,
            store,
            shared,
            config: RwLock::new(config),
        }
    }

    /// Swap the audit sink (tests, readiness diagnostics).
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Swap the country resolver.
    #[must_use]
    pub fn with_geo(mut self, geo: Arc<dyn CountryResolver>) -> Self {
        self.geo = geo;
        self
    }

    /// Current config snapshot. Cheap clone; callers never hold the lock
    /// across an await point.
    #[must_use]
    pub fn config(&self) -> GatewayConfig {
        self.config.read().clone()
    }

    /// Replace the runtime-tunable config (SIGHUP hot reload).
    pub fn reload_config(&self, config: GatewayConfig) {
        *self.config.write() = config;
    }
}
