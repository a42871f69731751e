use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};

use doorman_core::{AuthClaims, TokenType};

use crate::error::AuthError;

/// An issued token plus the metadata the caller needs to set cookies.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    /// Seconds since epoch.
    pub expires_at: u64,
    pub token_type: TokenType,
}

/// Issues and validates HS256 tokens.
///
/// The signing secret is immutable after construction; rotating it
/// invalidates every outstanding session by design of the deployment, not
/// of this type.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Build from the raw secret and the two expiry classes.
    #[must_use]
    pub fn new(secret: &str, access_minutes: u64, refresh_days: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::from_secs(access_minutes * 60),
            refresh_ttl: Duration::from_secs(refresh_days * 86_400),
        }
    }

    /// Issue a token for `sub` with the given role.
    pub fn issue(&self, sub: &str, role: &str, refresh: bool) -> Result<IssuedToken, AuthError> {
        let jti = uuid::Uuid::new_v4().to_string();
        let ttl = if refresh { self.refresh_ttl } else { self.access_ttl };
        let exp = jsonwebtoken::get_current_timestamp() + ttl.as_secs();
        let token_type = if refresh {
            TokenType::Refresh
        } else {
            TokenType::Access
        };

        let claims = AuthClaims {
            sub: sub.to_owned(),
            role: role.to_owned(),
            jti: jti.clone(),
            exp,
            token_type,
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Backend(format!("token encoding failed: {e}")))?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at: exp,
            token_type,
        })
    }

    /// Validate signature and expiry, returning the claims.
    ///
    /// Blacklist checks are layered on top by the caller — this function
    /// is deliberately free of I/O.
    pub fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let data = decode::<AuthClaims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        Ok(data.claims)
    }

    /// Verify a refresh token specifically; access tokens are rejected so a
    /// leaked short-lived token cannot mint new sessions.
    pub fn verify_refresh(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let claims = self.verify(token)?;
        if !claims.is_refresh() {
            return Err(AuthError::Invalid(
                "access token presented where refresh token required".to_owned(),
            ));
        }
        Ok(claims)
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> TokenService {
        TokenService::new("unit-test-secret", 15, 7)
    }

    #[test]
    fn issue_then_verify() {
        let svc = svc();
        let issued = svc.issue("alice", "client", false).unwrap();
        let claims = svc.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, "client");
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let issued = svc().issue("alice", "client", false).unwrap();
        let other = TokenService::new("different-secret", 15, 7);
        assert!(matches!(
            other.verify(&issued.token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            svc().verify("not.a.token"),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn refresh_class_is_enforced() {
        let svc = svc();
        let access = svc.issue("alice", "client", false).unwrap();
        let refresh = svc.issue("alice", "client", true).unwrap();

        assert!(matches!(
            svc.verify_refresh(&access.token),
            Err(AuthError::Invalid(_))
        ));
        let claims = svc.verify_refresh(&refresh.token).unwrap();
        assert_eq!(claims.token_type, TokenType::Refresh);
    }

    #[test]
    fn refresh_outlives_access() {
        let svc = svc();
        let access = svc.issue("alice", "client", false).unwrap();
        let refresh = svc.issue("alice", "client", true).unwrap();
        assert!(refresh.expires_at > access.expires_at);
    }
}
