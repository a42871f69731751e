//! The minimal token surface the gateway plane depends on:
//! `POST /auth/login`, `POST /auth/refresh`, `POST /auth/logout`.
//!
//! All three sit behind the pre-auth IP rate limit. Login failures do not
//! reveal whether the user exists.

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::{Deserialize, Serialize};

use doorman_auth::{ACCESS_TOKEN_COOKIE, verify_password};
use doorman_core::User;
use doorman_gateway::GatewayError;
use doorman_store::{ConfigStoreExt, Filter, collections};

use crate::app::AppState;
use crate::error::ServerError;
use crate::extract;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    /// Seconds until the access token expires.
    pub expires_in: u64,
}

/// Apply the fixed-window IP limit unless disabled.
async fn ip_gate(state: &AppState, headers: &HeaderMap, peer: SocketAddr) -> Result<(), ServerError> {
    let ctx = state.gateway.context();
    let config = ctx.config();
    if config.ip_rate_disabled {
        return Ok(());
    }
    let ip = extract::client_ip(headers, peer.ip());
    match ctx
        .limiter
        .check_ip(&ip.to_string(), config.ip_rate_limit, config.ip_rate_window_secs)
        .await
    {
        Ok(_) => Ok(()),
        Err(GatewayError::RateLimited { retry_after, .. }) => {
            Err(ServerError::RateLimited { retry_after })
        }
        Err(other) => Err(other.into()),
    }
}

async fn find_user(state: &AppState, request: &LoginRequest) -> Option<User> {
    let ctx = state.gateway.context();
    if let Some(username) = &request.username {
        return ctx
            .store
            .get_one(collections::USERS, &Filter::new().eq("username", username.as_str()))
            .await
            .ok();
    }
    if let Some(email) = &request.email {
        return ctx
            .store
            .get_one(collections::USERS, &Filter::new().eq("email", email.as_str()))
            .await
            .ok();
    }
    None
}

fn auth_cookie(token: &str, max_age_secs: u64) -> String {
    format!(
        "{ACCESS_TOKEN_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_secs}"
    )
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ServerError> {
    ip_gate(&state, &headers, peer).await?;

    if request.username.is_none() && request.email.is_none() {
        return Err(ServerError::MissingCredentials(
            "username or email required".to_owned(),
        ));
    }

    let ctx = state.gateway.context();
    let user = find_user(&state, &request).await;
    // Same answer for unknown user and wrong password.
    let authorized = user
        .as_ref()
        .is_some_and(|u| u.active && verify_password(&u.password_hash, &request.password));
    let Some(user) = user.filter(|_| authorized) else {
        return Err(ServerError::Unauthorized(
            "invalid username or password".to_owned(),
        ));
    };

    let access = ctx
        .tokens
        .issue(&user.username, &user.role, false)
        .map_err(|e| ServerError::Config(e.to_string()))?;
    let refresh = ctx
        .tokens
        .issue(&user.username, &user.role, true)
        .map_err(|e| ServerError::Config(e.to_string()))?;

    let expires_in = ctx.tokens.access_ttl().as_secs();
    let body = TokenResponse {
        access_token: access.token.clone(),
        refresh_token: Some(refresh.token),
        token_type: "bearer",
        expires_in,
    };

    let mut response = (StatusCode::OK, Json(body)).into_response();
    if let Ok(cookie) = auth_cookie(&access.token, expires_in).parse() {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

async fn refresh(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> Result<Response, ServerError> {
    ip_gate(&state, &headers, peer).await?;

    let ctx = state.gateway.context();
    let claims = ctx
        .tokens
        .verify_refresh(&request.refresh_token)
        .map_err(|e| ServerError::Unauthorized(e.to_string()))?;
    if ctx
        .blacklist
        .is_blacklisted(&claims.sub, &claims.jti)
        .await
        .map_err(|e| ServerError::Config(e.to_string()))?
    {
        return Err(ServerError::Unauthorized("token has been revoked".to_owned()));
    }

    let access = ctx
        .tokens
        .issue(&claims.sub, &claims.role, false)
        .map_err(|e| ServerError::Config(e.to_string()))?;
    let expires_in = ctx.tokens.access_ttl().as_secs();
    let body = TokenResponse {
        access_token: access.token.clone(),
        refresh_token: None,
        token_type: "bearer",
        expires_in,
    };

    let mut response = (StatusCode::OK, Json(body)).into_response();
    if let Ok(cookie) = auth_cookie(&access.token, expires_in).parse() {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let ctx = state.gateway.context();
    let Some(token) = extract::extract_token(&headers) else {
        return Err(ServerError::Unauthorized("no token presented".to_owned()));
    };
    let claims = ctx
        .tokens
        .verify(&token)
        .map_err(|e| ServerError::Unauthorized(e.to_string()))?;
    ctx.blacklist
        .blacklist(&claims.sub, &claims.jti, claims.exp)
        .await
        .map_err(|e| ServerError::Config(e.to_string()))?;

    let mut response = (
        StatusCode::OK,
        Json(serde_json::json!({"message": "logged out"})),
    )
        .into_response();
    if let Ok(cookie) =
        format!("{ACCESS_TOKEN_COOKIE}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0").parse()
    {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}
