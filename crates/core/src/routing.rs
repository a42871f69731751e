use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Steers a caller identified by `client_key` to a specific server list
/// and/or injects extra headers on the outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub client_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_description: Option<String>,
    /// When set, replaces the API's server list for this caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_servers: Option<Vec<String>>,
    /// Extra headers injected into the outbound request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing_headers: BTreeMap<String, String>,
}
