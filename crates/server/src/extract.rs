//! Caller extraction helpers.
//!
//! The token is accepted from either the bearer header or the HTTP-only
//! `access_token_cookie`; the client IP honors `X-Forwarded-For` when the
//! fronting proxy sets it.

use std::net::IpAddr;

use axum::http::HeaderMap;

use doorman_auth::ACCESS_TOKEN_COOKIE;

/// Extract the raw token: `Authorization: Bearer ...` wins over the
/// cookie.
#[must_use]
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION)
        && let Ok(value) = auth.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_owned());
    }
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let (name, value) = pair.trim().split_once('=')?;
        if name == ACCESS_TOKEN_COOKIE {
            return Some(value.trim().to_owned());
        }
    }
    None
}

/// Resolve the client IP: first `X-Forwarded-For` entry, else the socket
/// peer address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer)
}
