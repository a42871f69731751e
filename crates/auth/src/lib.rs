//! Signed-token issuance, validation, blacklist, and credential checks.
//!
//! Tokens are HMAC-signed (HS256) with a process-wide secret loaded at
//! startup. Revocation is tracked per user as a min-heap of `(exp, jti)`
//! pairs in the shared store, so a logout on one worker is visible to all.

mod blacklist;
mod error;
mod password;
mod token;

pub use blacklist::TokenBlacklist;
pub use error::AuthError;
pub use password::{hash_password, verify_password};
pub use token::{IssuedToken, TokenService};

/// Cookie name the extractor accepts alongside the bearer header.
pub const ACCESS_TOKEN_COOKIE: &str = "access_token_cookie";
