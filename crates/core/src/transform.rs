//! Declarative request/response rewrite configuration.
//!
//! Body paths use a restricted JSONPath form: `$.field.nested[0].leaf`.
//! Configs are validated when loaded; the gateway refuses invalid ones
//! rather than failing per request.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static PATH_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+(\[\d+\])?$").expect("valid regex"));

/// Returns `true` for a well-formed `$.a.b[0].c` path.
#[must_use]
pub fn is_valid_body_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("$.") else {
        return false;
    };
    !rest.is_empty() && rest.split('.').all(|seg| PATH_SEGMENT_RE.is_match(seg))
}

/// Header rewrites applied to a request or response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeaderTransforms {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    /// `old_name -> new_name`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
}

/// JSON body rewrites keyed by body path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BodyTransforms {
    /// `path -> value` fields to set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    /// `old_path -> new_path`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
    /// Wrap the whole body under this path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap: Option<String>,
}

/// Query-string rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryTransforms {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rename: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RequestTransforms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderTransforms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyTransforms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryTransforms>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseTransforms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderTransforms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<BodyTransforms>,
    /// `"503" -> 502`-style status remaps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status_map: BTreeMap<String, u16>,
}

/// Per-API or per-endpoint transform configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestTransforms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseTransforms>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformConfigError {
    #[error("invalid body path: {0}")]
    InvalidPath(String),
    #[error("invalid status code in map: {0}")]
    InvalidStatus(String),
    #[error("empty header name in transform")]
    EmptyHeaderName,
}

fn check_body(body: &BodyTransforms) -> Result<(), TransformConfigError> {
    for path in body
        .add
        .keys()
        .chain(body.remove.iter())
        .chain(body.rename.keys())
        .chain(body.rename.values())
        .chain(body.wrap.iter())
    {
        if !is_valid_body_path(path) {
            return Err(TransformConfigError::InvalidPath(path.clone()));
        }
    }
    Ok(())
}

fn check_headers(headers: &HeaderTransforms) -> Result<(), TransformConfigError> {
    let names = headers
        .add
        .keys()
        .chain(headers.remove.iter())
        .chain(headers.rename.keys())
        .chain(headers.rename.values());
    for name in names {
        if name.trim().is_empty() {
            return Err(TransformConfigError::EmptyHeaderName);
        }
    }
    Ok(())
}

impl TransformConfig {
    /// Validate every path, header name, and status literal. Called when a
    /// config is loaded; invalid configs are rejected outright.
    pub fn validate(&self) -> Result<(), TransformConfigError> {
        if let Some(req) = &self.request {
            if let Some(h) = &req.headers {
                check_headers(h)?;
            }
            if let Some(b) = &req.body {
                check_body(b)?;
            }
        }
        if let Some(resp) = &self.response {
            if let Some(h) = &resp.headers {
                check_headers(h)?;
            }
            if let Some(b) = &resp.body {
                check_body(b)?;
            }
            for (from, to) in &resp.status_map {
                let parsed: Option<u16> = from.parse().ok();
                let from_ok = parsed.is_some_and(|c| (100..=599).contains(&c));
                let to_ok = (100..=599).contains(to);
                if !from_ok || !to_ok {
                    return Err(TransformConfigError::InvalidStatus(format!("{from} -> {to}")));
                }
            }
        }
        Ok(())
    }
}
