use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::group::ALL_GROUP;
use crate::window::WindowUnit;

/// A gateway user.
///
/// `username` and `email` are unique (email compared lowercased). The
/// password is stored as an Argon2id PHC string; the salt is embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    /// Always contains [`ALL_GROUP`].
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub ui_access: bool,
    /// Optional tier assignment; tier limits take precedence over the
    /// per-user fallback fields below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,

    // Per-user fallback rate limit: allowed requests per window.
    #[serde(default)]
    pub rate_limit_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_duration_type: Option<WindowUnit>,

    // Per-user soft throttle: allowed requests per window before delays kick in.
    #[serde(default)]
    pub throttle_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_duration_type: Option<WindowUnit>,
    /// Delay applied per excess request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_wait_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_wait_duration_type: Option<WindowUnit>,
    /// Absolute cap on queued excess before a hard 429.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_queue_limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl User {
    /// Groups with [`ALL_GROUP`] guaranteed present.
    #[must_use]
    pub fn effective_groups(&self) -> Vec<String> {
        let mut groups = self.groups.clone();
        if !groups.iter().any(|g| g == ALL_GROUP) {
            groups.push(ALL_GROUP.to_owned());
        }
        groups
    }

    /// Whether the fallback rate limit applies (explicit flag or configured
    /// duration).
    #[must_use]
    pub fn rate_limit_active(&self) -> bool {
        self.rate_limit_enabled || self.rate_limit_duration.is_some()
    }

    /// Whether the soft throttle applies.
    #[must_use]
    pub fn throttle_active(&self) -> bool {
        self.throttle_enabled
            || self.throttle_duration.is_some()
            || self.throttle_queue_limit.is_some()
    }
}
