use std::time::Duration;

/// Configuration for the Redis shared-store backend.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    /// Password, if the server requires AUTH.
    pub password: Option<String>,
    /// Key prefix applied to every Redis key to avoid collisions.
    pub prefix: String,
    /// Number of connections in the `deadpool-redis` pool.
    pub pool_size: usize,
    /// Timeout for acquiring a pooled connection.
    pub connection_timeout: Duration,
    /// Use `rediss://` (TLS) instead of `redis://`.
    pub tls_enabled: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 6379,
            db: 0,
            password: None,
            prefix: String::from("doorman"),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
            tls_enabled: false,
        }
    }
}

impl RedisConfig {
    /// Render the connection URL. The password, when present, is embedded
    /// as URL userinfo.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls_enabled { "rediss" } else { "redis" };
        match &self.password {
            Some(password) => format!(
                "{scheme}://:{password}@{}:{}/{}",
                self.host, self.port, self.db
            ),
            None => format!("{scheme}://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url() {
        let cfg = RedisConfig::default();
        assert_eq!(cfg.url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn url_with_password_and_tls() {
        let cfg = RedisConfig {
            password: Some("hunter2".into()),
            tls_enabled: true,
            db: 3,
            ..RedisConfig::default()
        };
        assert_eq!(cfg.url(), "rediss://:hunter2@127.0.0.1:6379/3");
    }
}
