use serde::{Deserialize, Serialize};

/// Per-user list of `"{name}/{version}"` APIs the user may invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Subscription {
    pub username: String,
    #[serde(default)]
    pub apis: Vec<String>,
}

impl Subscription {
    #[must_use]
    pub fn is_subscribed(&self, name_version: &str) -> bool {
        self.apis.iter().any(|a| a == name_version)
    }
}
