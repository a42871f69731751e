use serde::{Deserialize, Serialize};

/// Token expiry class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Access,
    Refresh,
}

/// Claims carried by every issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    /// Subject (username).
    pub sub: String,
    /// Role name at issue time.
    pub role: String,
    /// Unique token ID for revocation tracking.
    pub jti: String,
    /// Expiry, seconds since epoch.
    pub exp: u64,
    #[serde(default)]
    pub token_type: TokenType,
}

impl AuthClaims {
    #[must_use]
    pub fn is_refresh(&self) -> bool {
        self.token_type == TokenType::Refresh
    }
}
