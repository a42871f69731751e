use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transform::TransformConfig;

/// The wire protocol an API speaks upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    Rest,
    Soap,
    Graphql,
    Grpc,
}

impl ApiType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Soap => "soap",
            Self::Graphql => "graphql",
            Self::Grpc => "grpc",
        }
    }

    /// Parse the path segment used in `/api/{type}/...` URLs.
    #[must_use]
    pub fn from_path_segment(s: &str) -> Option<Self> {
        match s {
            "rest" => Some(Self::Rest),
            "soap" => Some(Self::Soap),
            "graphql" => Some(Self::Graphql),
            "grpc" => Some(Self::Grpc),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the per-API IP policy interprets the allow/deny lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IpMode {
    #[default]
    AllowAll,
    AllowListOnly,
    DenyList,
}

/// Where a credit group sits relative to its key-rotation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// Rotation has not started; only the primary key is valid.
    BeforeRotation,
    /// Inside the grace window; both keys are valid, the new key preferred.
    Grace,
    /// At or after expiry; only the new key is valid.
    AfterExpiry,
}

/// A configured upstream API.
///
/// `(api_name, api_version)` is unique; the synthesized
/// [`api_path`](Api::api_path) is the primary cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    pub api_name: String,
    pub api_version: String,
    /// Stable UUID assigned at creation.
    pub api_id: String,
    pub api_type: ApiType,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Ordered absolute upstream URLs. gRPC servers use `grpc://` or `grpcs://`.
    pub api_servers: Vec<String>,
    #[serde(default)]
    pub api_allowed_retry_count: u32,
    #[serde(default)]
    pub api_allowed_roles: BTreeSet<String>,
    #[serde(default)]
    pub api_allowed_groups: BTreeSet<String>,
    /// Public APIs bypass auth and subscription checks entirely.
    #[serde(default)]
    pub api_public: bool,
    #[serde(default)]
    pub api_credits_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_credit_group: Option<String>,
    #[serde(default)]
    pub api_ip_allow: Vec<String>,
    #[serde(default)]
    pub api_ip_deny: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_ip_mode: Option<IpMode>,
    /// ISO country codes denied by the geographic policy.
    #[serde(default)]
    pub api_country_deny: Vec<String>,
    #[serde(default)]
    pub api_cors_allow_origins: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_wsdl_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_grpc_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_openapi_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_transforms: Option<TransformConfig>,
    /// Ad-hoc fields consumed by transforms and validation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dynamic_attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

/// Config-time validation failures for an [`Api`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiConfigError {
    #[error("public API cannot have credits enabled")]
    PublicCreditsConflict,
    #[error("api_servers must not be empty")]
    NoServers,
    #[error("credits enabled but api_credit_group is missing")]
    MissingCreditGroup,
    #[error("invalid server URL: {0}")]
    InvalidServer(String),
}

impl Api {
    /// Synthesized `/{name}/{version}` path, the primary lookup key.
    #[must_use]
    pub fn api_path(&self) -> String {
        format!("/{}/{}", self.api_name, self.api_version)
    }

    /// `{name}/{version}` form used by subscriptions and group access lists.
    #[must_use]
    pub fn name_version(&self) -> String {
        format!("{}/{}", self.api_name, self.api_version)
    }

    /// Validate the cross-field invariants enforced at configuration time.
    pub fn validate(&self) -> Result<(), ApiConfigError> {
        if self.api_public && self.api_credits_enabled {
            return Err(ApiConfigError::PublicCreditsConflict);
        }
        if self.api_servers.is_empty() {
            return Err(ApiConfigError::NoServers);
        }
        if self.api_credits_enabled && self.api_credit_group.is_none() {
            return Err(ApiConfigError::MissingCreditGroup);
        }
        for server in &self.api_servers {
            let ok = match self.api_type {
                ApiType::Grpc => {
                    server.starts_with("grpc://") || server.starts_with("grpcs://")
                }
                _ => server.starts_with("http://") || server.starts_with("https://"),
            };
            if !ok {
                return Err(ApiConfigError::InvalidServer(server.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> Api {
        Api {
            api_name: "echo".into(),
            api_version: "v1".into(),
            api_id: uuid::Uuid::new_v4().to_string(),
            api_type: ApiType::Rest,
            active: true,
            api_servers: vec!["http://upstream/".into()],
            api_allowed_retry_count: 0,
            api_allowed_roles: BTreeSet::new(),
            api_allowed_groups: BTreeSet::new(),
            api_public: false,
            api_credits_enabled: false,
            api_credit_group: None,
            api_ip_allow: vec![],
            api_ip_deny: vec![],
            api_ip_mode: None,
            api_country_deny: vec![],
            api_cors_allow_origins: vec![],
            api_wsdl_url: None,
            api_grpc_package: None,
            api_openapi_url: None,
            api_transforms: None,
            dynamic_attributes: BTreeMap::new(),
            created_at: None,
        }
    }

    #[test]
    fn api_path_is_synthesized() {
        let a = api();
        assert_eq!(a.api_path(), "/echo/v1");
        assert_eq!(a.name_version(), "echo/v1");
    }

    #[test]
    fn public_and_credits_conflict() {
        let mut a = api();
        a.api_public = true;
        a.api_credits_enabled = true;
        a.api_credit_group = Some("g1".into());
        assert_eq!(a.validate(), Err(ApiConfigError::PublicCreditsConflict));
    }

    #[test]
    fn credits_require_group() {
        let mut a = api();
        a.api_credits_enabled = true;
        assert_eq!(a.validate(), Err(ApiConfigError::MissingCreditGroup));
    }

    #[test]
    fn grpc_servers_require_grpc_scheme() {
        let mut a = api();
        a.api_type = ApiType::Grpc;
        assert!(matches!(
            a.validate(),
            Err(ApiConfigError::InvalidServer(_))
        ));
        a.api_servers = vec!["grpcs://host:443".into()];
        assert!(a.validate().is_ok());
    }

    #[test]
    fn api_type_path_segments() {
        assert_eq!(ApiType::from_path_segment("rest"), Some(ApiType::Rest));
        assert_eq!(ApiType::from_path_segment("grpc"), Some(ApiType::Grpc));
        assert_eq!(ApiType::from_path_segment("ftp"), None);
    }
}
