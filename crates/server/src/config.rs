//! Server settings: TOML file, environment overrides, startup validation.
//!
//! Every environment variable the deployment surface documents is applied
//! on top of the file values. Validation runs before the listener binds;
//! failures exit nonzero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use doorman_gateway::GatewayConfig;
use doorman_gateway::circuit::CircuitBreakerConfig;

use crate::error::ServerError;

/// Which shared backend serves cache, counters, and blacklists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendMode {
    #[default]
    Mem,
    Redis,
    /// External document store for config plus Redis-compatible shared
    /// state; wired by the operator.
    External,
}

impl BackendMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "MEM" => Some(Self::Mem),
            "REDIS" => Some(Self::Redis),
            "EXTERNAL" => Some(Self::External),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Worker count; gates the multi-worker safety check.
    pub threads: u32,
    pub https_only: bool,
    pub https_enabled: bool,
    pub ssl_certfile: Option<PathBuf>,
    pub ssl_keyfile: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 5001,
            threads: 1,
            https_only: false,
            https_enabled: false,
            ssl_certfile: None,
            ssl_keyfile: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackendSettings {
    pub mode: BackendMode,
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: Option<String>,
    pub access_token_expires_minutes: u64,
    pub refresh_token_expires_days: u64,
    pub login_ip_rate_disabled: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_token_expires_minutes: 15,
            refresh_token_expires_days: 7,
            login_ip_rate_disabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    /// Reject unknown origins outright instead of omitting CORS headers.
    pub strict: bool,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allow_credentials: false,
            allow_methods: vec![
                "GET".to_owned(),
                "POST".to_owned(),
                "PUT".to_owned(),
                "DELETE".to_owned(),
                "PATCH".to_owned(),
                "OPTIONS".to_owned(),
            ],
            allow_headers: vec!["*".to_owned()],
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BodyLimitSettings {
    /// Global cap; enforced even under chunked encoding.
    pub max_body_size_bytes: usize,
    pub max_body_size_bytes_rest: Option<usize>,
    pub max_body_size_bytes_soap: Option<usize>,
    pub max_body_size_bytes_graphql: Option<usize>,
}

impl Default for BodyLimitSettings {
    fn default() -> Self {
        Self {
            max_body_size_bytes: 10 * 1024 * 1024,
            max_body_size_bytes_rest: None,
            max_body_size_bytes_soap: None,
            max_body_size_bytes_graphql: None,
        }
    }
}

impl BodyLimitSettings {
    /// Effective cap for a route family (`rest`, `soap`, `graphql`, ...).
    #[must_use]
    pub fn cap_for(&self, family: &str) -> usize {
        let specific = match family {
            "rest" => self.max_body_size_bytes_rest,
            "soap" => self.max_body_size_bytes_soap,
            "graphql" => self.max_body_size_bytes_graphql,
            _ => None,
        };
        specific.unwrap_or(self.max_body_size_bytes)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CryptoSettings {
    /// Master key material for the embedded profile's encrypted state.
    pub mem_encryption_key: Option<String>,
    /// Master key material for per-user vault derivation.
    pub vault_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminSettings {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayTuning {
    pub request_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub strict_response_envelope: bool,
    pub enable_grpc_reflection: bool,
    pub proto_dir: PathBuf,
    pub metrics_pct_samples: Option<usize>,
    pub ip_rate_limit: u64,
    pub ip_rate_window_secs: u64,
    pub circuit_enabled: bool,
    pub circuit_failure_threshold: u32,
    pub circuit_success_threshold: u32,
    pub circuit_recovery_timeout_secs: u64,
}

impl Default for GatewayTuning {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            backoff_base_ms: 200,
            strict_response_envelope: false,
            enable_grpc_reflection: false,
            proto_dir: PathBuf::from("generated/proto"),
            metrics_pct_samples: None,
            ip_rate_limit: 10,
            ip_rate_window_secs: 60,
            circuit_enabled: true,
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_recovery_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub path: PathBuf,
    pub autosave_interval_secs: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("doorman-state.snapshot"),
            autosave_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// The full server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub environment: Environment,
    pub server: ServerSettings,
    pub backend: BackendSettings,
    pub auth: AuthSettings,
    pub cors: CorsSettings,
    pub limits: BodyLimitSettings,
    pub crypto: CryptoSettings,
    pub admin: AdminSettings,
    pub gateway: GatewayTuning,
    pub snapshot: SnapshotSettings,
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Settings {
    /// Load from a TOML file (missing file means defaults) and apply
    /// process environment overrides.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let mut settings: Settings = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)
                .map_err(|e| ServerError::Config(format!("config parse failed: {e}")))?
        } else {
            Settings::default()
        };
        settings.apply_env_from(&|name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Apply overrides from an environment lookup. Split out so tests can
    /// inject a map instead of mutating the process environment.
    #[allow(clippy::too_many_lines)]
    pub fn apply_env_from(&mut self, get: &dyn Fn(&str) -> Option<String>) {
        if let Some(raw) = get("MEM_OR_EXTERNAL")
            && let Some(mode) = BackendMode::parse(&raw)
        {
            self.backend.mode = mode;
        }
        if let Some(raw) = get("THREADS")
            && let Ok(threads) = raw.trim().parse()
        {
            self.server.threads = threads;
        }
        if let Some(raw) = get("JWT_SECRET_KEY") {
            self.auth.jwt_secret = Some(raw);
        }
        if let Some(raw) = get("ACCESS_TOKEN_EXPIRES_MINUTES")
            && let Ok(minutes) = raw.trim().parse()
        {
            self.auth.access_token_expires_minutes = minutes;
        }
        if let Some(raw) = get("REFRESH_TOKEN_EXPIRES_DAYS")
            && let Ok(days) = raw.trim().parse()
        {
            self.auth.refresh_token_expires_days = days;
        }
        if let Some(raw) = get("LOGIN_IP_RATE_DISABLED") {
            self.auth.login_ip_rate_disabled = parse_bool(&raw);
        }
        if let Some(raw) = get("HTTPS_ONLY") {
            self.server.https_only = parse_bool(&raw);
        }
        if let Some(raw) = get("HTTPS_ENABLED") {
            self.server.https_enabled = parse_bool(&raw);
        }
        if let Some(raw) = get("SSL_CERTFILE") {
            self.server.ssl_certfile = Some(PathBuf::from(raw));
        }
        if let Some(raw) = get("SSL_KEYFILE") {
            self.server.ssl_keyfile = Some(PathBuf::from(raw));
        }
        if let Some(raw) = get("ALLOWED_ORIGINS") {
            self.cors.allowed_origins = parse_list(&raw);
        }
        if let Some(raw) = get("ALLOW_CREDENTIALS") {
            self.cors.allow_credentials = parse_bool(&raw);
        }
        if let Some(raw) = get("ALLOW_METHODS") {
            self.cors.allow_methods = parse_list(&raw);
        }
        if let Some(raw) = get("ALLOW_HEADERS") {
            self.cors.allow_headers = parse_list(&raw);
        }
        if let Some(raw) = get("CORS_STRICT") {
            self.cors.strict = parse_bool(&raw);
        }
        if let Some(raw) = get("MAX_BODY_SIZE_BYTES")
            && let Ok(size) = raw.trim().parse()
        {
            self.limits.max_body_size_bytes = size;
        }
        if let Some(raw) = get("MAX_BODY_SIZE_BYTES_REST")
            && let Ok(size) = raw.trim().parse()
        {
            self.limits.max_body_size_bytes_rest = Some(size);
        }
        if let Some(raw) = get("MAX_BODY_SIZE_BYTES_SOAP")
            && let Ok(size) = raw.trim().parse()
        {
            self.limits.max_body_size_bytes_soap = Some(size);
        }
        if let Some(raw) = get("MAX_BODY_SIZE_BYTES_GRAPHQL")
            && let Ok(size) = raw.trim().parse()
        {
            self.limits.max_body_size_bytes_graphql = Some(size);
        }
        if let Some(raw) = get("VAULT_KEY") {
            self.crypto.vault_key = Some(raw);
        }
        if let Some(raw) = get("MEM_ENCRYPTION_KEY") {
            self.crypto.mem_encryption_key = Some(raw);
        }
        if let Some(raw) = get("DOORMAN_ADMIN_EMAIL") {
            self.admin.email = Some(raw);
        }
        if let Some(raw) = get("DOORMAN_ADMIN_PASSWORD") {
            self.admin.password = Some(raw);
        }
        if let Some(raw) = get("REDIS_HOST") {
            self.backend.redis.host = raw;
        }
        if let Some(raw) = get("REDIS_PORT")
            && let Ok(port) = raw.trim().parse()
        {
            self.backend.redis.port = port;
        }
        if let Some(raw) = get("REDIS_DB")
            && let Ok(db) = raw.trim().parse()
        {
            self.backend.redis.db = db;
        }
        if let Some(raw) = get("REDIS_PASSWORD") {
            self.backend.redis.password = Some(raw);
        }
        if let Some(raw) = get("DOORMAN_ENABLE_GRPC_REFLECTION") {
            self.gateway.enable_grpc_reflection = parse_bool(&raw);
        }
        if let Some(raw) = get("STRICT_RESPONSE_ENVELOPE") {
            self.gateway.strict_response_envelope = parse_bool(&raw);
        }
        if let Some(raw) = get("METRICS_PCT_SAMPLES")
            && let Ok(samples) = raw.trim().parse()
        {
            self.gateway.metrics_pct_samples = Some(samples);
        }
        if let Some(raw) = get("DOORMAN_ENV")
            && raw.trim().eq_ignore_ascii_case("production")
        {
            self.environment = Environment::Production;
        }
    }

    /// Startup validation. Every failure is collected so the operator sees
    /// the full list at once; any failure prevents binding.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let production = self.environment == Environment::Production;

        // Multi-worker safety gate: per-worker counters multiply effective
        // rate limits and let revoked tokens pass on other workers.
        if self.server.threads > 1 && self.backend.mode == BackendMode::Mem {
            errors.push(format!(
                "THREADS={} requires a shared backend; MEM_OR_EXTERNAL=MEM is single-worker only",
                self.server.threads
            ));
        }

        if production && self.auth.jwt_secret.as_deref().unwrap_or("").is_empty() {
            errors.push("JWT_SECRET_KEY is required in production".to_owned());
        }

        if self.backend.mode == BackendMode::Mem
            && self.crypto.mem_encryption_key.as_deref().unwrap_or("").is_empty()
        {
            errors.push("MEM_ENCRYPTION_KEY is required in MEM mode".to_owned());
        }

        if production && self.backend.mode == BackendMode::Mem {
            if self.admin.email.as_deref().unwrap_or("").is_empty() {
                errors.push("DOORMAN_ADMIN_EMAIL is required in production MEM mode".to_owned());
            }
            if self.admin.password.as_deref().unwrap_or("").is_empty() {
                errors.push("DOORMAN_ADMIN_PASSWORD is required in production MEM mode".to_owned());
            }
        }

        if production && self.server.https_enabled {
            match &self.server.ssl_certfile {
                Some(path) if path.exists() => {}
                Some(path) => errors.push(format!("SSL_CERTFILE not found: {}", path.display())),
                None => errors.push("SSL_CERTFILE is required when HTTPS is enabled".to_owned()),
            }
            match &self.server.ssl_keyfile {
                Some(path) if path.exists() => {}
                Some(path) => errors.push(format!("SSL_KEYFILE not found: {}", path.display())),
                None => errors.push("SSL_KEYFILE is required when HTTPS is enabled".to_owned()),
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// The gateway-plane view of these settings. Rebuilt on SIGHUP for the
    /// reloadable subset.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            request_timeout: Duration::from_secs(self.gateway.request_timeout_secs),
            backoff_base: Duration::from_millis(self.gateway.backoff_base_ms),
            strict_envelope: self.gateway.strict_response_envelope,
            grpc_reflection_enabled: self.gateway.enable_grpc_reflection,
            proto_dir: self.gateway.proto_dir.clone(),
            ip_rate_limit: self.gateway.ip_rate_limit,
            ip_rate_window_secs: self.gateway.ip_rate_window_secs,
            ip_rate_disabled: self.auth.login_ip_rate_disabled,
            circuit: CircuitBreakerConfig {
                enabled: self.gateway.circuit_enabled,
                failure_threshold: self.gateway.circuit_failure_threshold,
                success_threshold: self.gateway.circuit_success_threshold,
                recovery_timeout: Duration::from_secs(self.gateway.circuit_recovery_timeout_secs),
            },
        }
    }

    /// Effective JWT secret; the development fallback never passes
    /// production validation.
    #[must_use]
    pub fn jwt_secret(&self) -> String {
        self.auth
            .jwt_secret
            .clone()
            .unwrap_or_else(|| "doorman-development-secret".to_owned())
    }
}

/// Helper for tests: an env getter over a map.
#[must_use]
pub fn env_from_map(map: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |name| map.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        env_from_map(map)
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = Settings::default();
        settings.apply_env_from(&env(&[
            ("MEM_OR_EXTERNAL", "REDIS"),
            ("THREADS", "4"),
            ("JWT_SECRET_KEY", "s3cret"),
            ("ACCESS_TOKEN_EXPIRES_MINUTES", "30"),
            ("MAX_BODY_SIZE_BYTES", "1024"),
            ("MAX_BODY_SIZE_BYTES_SOAP", "2048"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("STRICT_RESPONSE_ENVELOPE", "true"),
            ("REDIS_PORT", "6380"),
        ]));

        assert_eq!(settings.backend.mode, BackendMode::Redis);
        assert_eq!(settings.server.threads, 4);
        assert_eq!(settings.auth.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(settings.auth.access_token_expires_minutes, 30);
        assert_eq!(settings.limits.cap_for("rest"), 1024);
        assert_eq!(settings.limits.cap_for("soap"), 2048);
        assert_eq!(settings.cors.allowed_origins.len(), 2);
        assert!(settings.gateway.strict_response_envelope);
        assert_eq!(settings.backend.redis.port, 6380);
    }

    #[test]
    fn multi_worker_mem_mode_fails_validation() {
        let mut settings = Settings::default();
        settings.crypto.mem_encryption_key = Some("key".into());
        settings.server.threads = 4;
        settings.backend.mode = BackendMode::Mem;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("single-worker")));

        settings.backend.mode = BackendMode::Redis;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn production_requires_secrets() {
        let mut settings = Settings::default();
        settings.environment = Environment::Production;
        settings.crypto.mem_encryption_key = Some("key".into());

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("JWT_SECRET_KEY")));
        assert!(errors.iter().any(|e| e.contains("DOORMAN_ADMIN_EMAIL")));
        assert!(errors.iter().any(|e| e.contains("DOORMAN_ADMIN_PASSWORD")));
    }

    #[test]
    fn mem_mode_requires_encryption_key() {
        let settings = Settings::default();
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("MEM_ENCRYPTION_KEY")));
    }

    #[test]
    fn https_files_checked_in_production() {
        let mut settings = Settings::default();
        settings.environment = Environment::Production;
        settings.crypto.mem_encryption_key = Some("key".into());
        settings.auth.jwt_secret = Some("secret".into());
        settings.admin.email = Some("admin@example.com".into());
        settings.admin.password = Some("pw".into());
        settings.server.https_enabled = true;
        settings.server.ssl_certfile = Some(PathBuf::from("/definitely/missing/cert.pem"));

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("SSL_CERTFILE not found")));
        assert!(errors.iter().any(|e| e.contains("SSL_KEYFILE is required")));
    }

    #[test]
    fn body_cap_falls_back_to_global() {
        let limits = BodyLimitSettings {
            max_body_size_bytes: 100,
            max_body_size_bytes_rest: Some(50),
            ..BodyLimitSettings::default()
        };
        assert_eq!(limits.cap_for("rest"), 50);
        assert_eq!(limits.cap_for("graphql"), 100);
        assert_eq!(limits.cap_for("grpc"), 100);
    }

    #[test]
    fn gateway_config_mirrors_tuning() {
        let mut settings = Settings::default();
        settings.gateway.request_timeout_secs = 7;
        settings.gateway.circuit_failure_threshold = 9;
        let config = settings.gateway_config();
        assert_eq!(config.request_timeout, Duration::from_secs(7));
        assert_eq!(config.circuit.failure_threshold, 9);
    }
}
