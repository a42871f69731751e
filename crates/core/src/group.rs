use serde::{Deserialize, Serialize};

/// Synthetic group granting access to every active API; reserved.
pub const ALL_GROUP: &str = "ALL";

/// A named set of API grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub group_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_description: Option<String>,
    /// `"{name}/{version}"` entries this group may invoke.
    #[serde(default)]
    pub api_access: Vec<String>,
}

impl Group {
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.group_name == ALL_GROUP
    }

    #[must_use]
    pub fn grants(&self, name_version: &str) -> bool {
        self.api_access.iter().any(|a| a == name_version)
    }
}
