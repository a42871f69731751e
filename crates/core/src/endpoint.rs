use serde::{Deserialize, Serialize};

use crate::transform::TransformConfig;

/// How a WS-Security `UsernameToken` carries the password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SoapPasswordType {
    /// Plaintext `PasswordText` (for TLS-protected upstreams).
    Text,
    /// Legacy SHA-1 `PasswordDigest`; retained for upstreams that cannot
    /// verify anything newer. Network-only, never stored.
    Digest,
    /// SHA-256 digest, the preferred form.
    #[default]
    DigestSha256,
}

/// Credentials injected as a WS-Security header on SOAP dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoapSecurity {
    pub username: String,
    /// AEAD-encrypted password.
    pub password: String,
    #[serde(default)]
    pub password_type: SoapPasswordType,
    /// Include a random nonce in the token.
    #[serde(default = "default_nonce")]
    pub include_nonce: bool,
}

fn default_nonce() -> bool {
    true
}

/// A routable operation on an API.
///
/// `(api_name, api_version, endpoint_method, endpoint_uri)` is unique. The
/// gateway matches on the path portion only; query strings are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub endpoint_id: String,
    pub api_name: String,
    pub api_version: String,
    /// Upper-case HTTP method (`GET`, `POST`, ...).
    pub endpoint_method: String,
    /// Leading-slash URI relative to the API root, e.g. `/ping`.
    pub endpoint_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_soap_action: Option<String>,
    /// WS-Security credentials for SOAP upstreams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_soap_security: Option<SoapSecurity>,
    /// References an entry in the `endpoint_validations` collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_schema_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_transforms: Option<TransformConfig>,
}

impl Endpoint {
    /// Cache key: `{METHOD}:/{name}/{version}{uri}`.
    #[must_use]
    pub fn composite_key(&self) -> String {
        format!(
            "{}:/{}/{}{}",
            self.endpoint_method, self.api_name, self.api_version, self.endpoint_uri
        )
    }

    /// Normalize a request path for matching: strip the query string and any
    /// trailing slash (the root path stays `/`).
    #[must_use]
    pub fn normalize_uri(raw: &str) -> String {
        let path = raw.split('?').next().unwrap_or(raw);
        if path.len() > 1 && path.ends_with('/') {
            path[..path.len() - 1].to_owned()
        } else if path.is_empty() {
            "/".to_owned()
        } else {
            path.to_owned()
        }
    }
}
