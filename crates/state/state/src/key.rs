use serde::{Deserialize, Serialize};

/// The kind of shared state being stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Config-entity cache values (prefix is part of the id).
    Cache,
    /// Sliding-window rate-limit counters.
    RateLimit,
    /// Throttle-window counters.
    Throttle,
    /// Fixed-window pre-auth IP counters.
    IpRateLimit,
    /// Day/month usage quotas.
    Quota,
    /// Revoked-token heaps, one per user.
    TokenBlacklist,
    /// Per-API round-robin cursors.
    LoadBalancer,
    Custom(String),
}

impl KeyKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cache => "cache",
            Self::RateLimit => "rate_limit",
            Self::Throttle => "throttle_limit",
            Self::IpRateLimit => "ip_rate_limit",
            Self::Quota => "quota",
            Self::TokenBlacklist => "token_blacklist",
            Self::LoadBalancer => "load_balancer",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used to address entries in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub kind: KeyKind,
    pub id: String,
}

impl StateKey {
    #[must_use]
    pub fn new(kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Canonical string representation: `{kind}:{id}`.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_as_str() {
        assert_eq!(KeyKind::Cache.as_str(), "cache");
        assert_eq!(KeyKind::RateLimit.as_str(), "rate_limit");
        assert_eq!(KeyKind::IpRateLimit.as_str(), "ip_rate_limit");
        assert_eq!(KeyKind::TokenBlacklist.as_str(), "token_blacklist");
        assert_eq!(KeyKind::Custom("foo".into()).as_str(), "foo");
    }

    #[test]
    fn canonical_form() {
        let key = StateKey::new(KeyKind::RateLimit, "alice:42");
        assert_eq!(key.canonical(), "rate_limit:alice:42");
    }
}
