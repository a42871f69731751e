use thiserror::Error;

use doorman_core::codes;

/// Errors that can terminate the gateway pipeline.
///
/// Each variant maps to a stable `(HTTP status, error code)` pair; the
/// translation happens exactly once, at the HTTP boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    // -- identification -----------------------------------------------------
    #[error("authorization token missing")]
    TokenMissing,

    #[error("invalid token")]
    TokenInvalid,

    #[error("token expired")]
    TokenExpired,

    #[error("user account is not active")]
    UserInactive,

    // -- resolution ---------------------------------------------------------
    #[error("API not found or inactive")]
    ApiNotFound,

    #[error("endpoint not found")]
    EndpointNotFound,

    // -- authorization ------------------------------------------------------
    #[error("role does not permit this API")]
    RoleDenied,

    #[error("no subscription or group grants access")]
    SubscriptionRequired,

    #[error("client IP not permitted")]
    IpDenied,

    #[error("client region not permitted")]
    GeoDenied,

    // -- quota --------------------------------------------------------------
    #[error("rate limit exceeded")]
    RateLimited {
        retry_after: u64,
        limit: u64,
        remaining: u64,
        reset: u64,
    },

    #[error("throttle queue limit exceeded")]
    ThrottleQueueFull,

    #[error("insufficient credits")]
    InsufficientCredits,

    // -- validation ---------------------------------------------------------
    #[error("validation failed at {path}: {message}")]
    SchemaViolation { path: String, message: String },

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    // -- transport ----------------------------------------------------------
    #[error("request body too large")]
    BodyTooLarge,

    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),

    // -- upstream -----------------------------------------------------------
    #[error("no available upstream servers")]
    NoServers,

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream returned status {status} after retries")]
    UpstreamStatus { status: u16 },

    #[error("protobuf encode/decode failed: {0}")]
    ProtoDecode(String),

    // -- lifecycle ----------------------------------------------------------
    #[error("request cancelled by client")]
    Cancelled,

    // -- internal -----------------------------------------------------------
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status the caller sees. Cancelled requests use the de-facto
    /// `499` client-closed-request status so metrics can tell them apart.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::TokenMissing | Self::TokenInvalid | Self::TokenExpired | Self::UserInactive => {
                401
            }
            Self::RoleDenied
            | Self::SubscriptionRequired
            | Self::IpDenied
            | Self::GeoDenied
            | Self::InsufficientCredits => 403,
            Self::ApiNotFound | Self::EndpointNotFound => 404,
            Self::RateLimited { .. } | Self::ThrottleQueueFull => 429,
            Self::SchemaViolation { .. } => 422,
            Self::MalformedBody(_) | Self::ProtoDecode(_) => 400,
            Self::BodyTooLarge => 413,
            Self::UnsupportedMedia(_) => 415,
            Self::NoServers | Self::CircuitOpen => 503,
            Self::UpstreamConnect(_) => 502,
            Self::UpstreamTimeout => 504,
            Self::UpstreamStatus { status } => *status,
            Self::Cancelled => 499,
            Self::Internal(_) => 500,
        }
    }

    /// Stable error-code literal for the response envelope.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TokenMissing => codes::AUTH_TOKEN_MISSING,
            Self::TokenInvalid => codes::AUTH_TOKEN_INVALID,
            Self::TokenExpired => codes::AUTH_TOKEN_EXPIRED,
            Self::UserInactive => codes::AUTH_USER_INACTIVE,
            Self::ApiNotFound => codes::API_NOT_FOUND,
            Self::EndpointNotFound => codes::END_NOT_FOUND,
            Self::RoleDenied => codes::API_PERMISSION_DENIED,
            Self::SubscriptionRequired => codes::SUB_NOT_FOUND,
            Self::IpDenied | Self::GeoDenied => codes::SEC_INVALID_IP,
            Self::RateLimited { .. } | Self::ThrottleQueueFull => codes::GTW_RATE_LIMIT_EXCEEDED,
            Self::InsufficientCredits => codes::CRD_INSUFFICIENT_CREDITS,
            Self::SchemaViolation { .. } => codes::GEN_VALIDATION_ERROR,
            Self::MalformedBody(_) => codes::VAL_INVALID_JSON,
            Self::BodyTooLarge => codes::REQ_BODY_TOO_LARGE,
            Self::UnsupportedMedia(_) => codes::GEN_INVALID_REQUEST,
            Self::NoServers => codes::GTW_NO_AVAILABLE_SERVERS,
            Self::CircuitOpen => codes::GTW_CIRCUIT_BREAKER_OPEN,
            Self::UpstreamConnect(_) => codes::GTW_UPSTREAM_ERROR,
            Self::UpstreamTimeout => codes::GTW_TIMEOUT,
            Self::UpstreamStatus { .. } => codes::GTW_UPSTREAM_ERROR,
            Self::ProtoDecode(_) => codes::GTW_PROTO_DECODE_ERROR,
            Self::Cancelled => codes::GTW_UNEXPECTED_ERROR,
            Self::Internal(_) => codes::ISE_INTERNAL_ERROR,
        }
    }
}

impl From<doorman_state::StateError> for GatewayError {
    fn from(e: doorman_state::StateError) -> Self {
        Self::Internal(format!("state backend: {e}"))
    }
}

impl From<doorman_store::StoreError> for GatewayError {
    fn from(e: doorman_store::StoreError) -> Self {
        match e {
            doorman_store::StoreError::NotFound { ref collection }
                if collection == doorman_store::collections::APIS =>
            {
                Self::ApiNotFound
            }
            doorman_store::StoreError::NotFound { ref collection }
                if collection == doorman_store::collections::ENDPOINTS =>
            {
                Self::EndpointNotFound
            }
            other => Self::Internal(format!("config store: {other}")),
        }
    }
}

impl From<doorman_cache::CacheError> for GatewayError {
    fn from(e: doorman_cache::CacheError) -> Self {
        Self::Internal(format!("cache: {e}"))
    }
}

impl From<doorman_auth::AuthError> for GatewayError {
    fn from(e: doorman_auth::AuthError) -> Self {
        match e {
            doorman_auth::AuthError::Expired => Self::TokenExpired,
            doorman_auth::AuthError::Invalid(_) | doorman_auth::AuthError::BadCredentials => {
                Self::TokenInvalid
            }
            doorman_auth::AuthError::Backend(msg) => Self::Internal(format!("auth backend: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_are_429() {
        let e = GatewayError::RateLimited {
            retry_after: 30,
            limit: 10,
            remaining: 0,
            reset: 0,
        };
        assert_eq!(e.status_code(), 429);
        assert_eq!(e.error_code(), codes::GTW_RATE_LIMIT_EXCEEDED);
    }

    #[test]
    fn upstream_status_propagates_literally() {
        let e = GatewayError::UpstreamStatus { status: 503 };
        assert_eq!(e.status_code(), 503);
    }

    #[test]
    fn subscription_denial_uses_sub005() {
        assert_eq!(GatewayError::SubscriptionRequired.error_code(), "SUB005");
        assert_eq!(GatewayError::SubscriptionRequired.status_code(), 403);
    }

    #[test]
    fn body_cap_uses_req001() {
        assert_eq!(GatewayError::BodyTooLarge.error_code(), "REQ001");
        assert_eq!(GatewayError::BodyTooLarge.status_code(), 413);
    }

    #[test]
    fn internal_uses_ise001() {
        assert_eq!(GatewayError::Internal("bug".into()).error_code(), "ISE001");
    }

    #[test]
    fn expired_auth_error_maps_to_expired() {
        let e: GatewayError = doorman_auth::AuthError::Expired.into();
        assert!(matches!(e, GatewayError::TokenExpired));
    }
}
