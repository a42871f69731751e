use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A per-user secret. `(username, key_name)` is unique; the value is
/// AEAD-encrypted with a key derived from the vault master key and the
/// user's identity, and only leaves the process at proxy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEntry {
    pub username: String,
    pub key_name: String,
    pub encrypted_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
