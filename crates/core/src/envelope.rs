use serde::{Deserialize, Serialize};

/// Gateway-originated error body: `{error_code, error_message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub error_message: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: code.into(),
            error_message: message.into(),
        }
    }
}

/// Strict-envelope wrapper: every response is HTTP 200 with the real
/// status folded into the body. Enabled by `STRICT_RESPONSE_ENVELOPE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrictEnvelope {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StrictEnvelope {
    #[must_use]
    pub fn success(status_code: u16, response: serde_json::Value) -> Self {
        Self {
            status_code,
            response: Some(response),
            error_code: None,
            error_message: None,
        }
    }

    #[must_use]
    pub fn error(status_code: u16, body: &ErrorBody) -> Self {
        Self {
            status_code,
            response: None,
            error_code: Some(body.error_code.clone()),
            error_message: Some(body.error_message.clone()),
        }
    }
}
