use thiserror::Error;

/// Authentication failures, kept distinct so the boundary can map expired
/// tokens to their own error code.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Signature valid, token past its `exp`.
    #[error("token expired")]
    Expired,

    /// Bad signature, malformed token, revoked jti, or wrong token class.
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Username/password check failed.
    #[error("invalid credentials")]
    BadCredentials,

    /// Shared-store failure while checking revocation state.
    #[error("auth backend error: {0}")]
    Backend(String),
}
