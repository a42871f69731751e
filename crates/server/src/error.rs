use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use doorman_core::{ErrorBody, codes};

/// Errors that can occur while running the Doorman server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error (also covers startup validation).
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The request carried no credentials at all.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Authentication failed (bad credentials, bad token).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Caller lacks permission for the requested operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// IP pre-auth rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the caller can retry.
        retry_after: u64,
    },

    /// A gateway-plane error surfaced outside the proxy pipeline.
    #[error(transparent)]
    Gateway(#[from] doorman_gateway::GatewayError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, message, retry_after) = match &self {
            Self::MissingCredentials(msg) => (
                StatusCode::UNAUTHORIZED,
                codes::AUTH_MISSING_CREDENTIALS,
                msg.clone(),
                None,
            ),
            Self::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                codes::AUTH_INVALID_CREDENTIALS,
                msg.clone(),
                None,
            ),
            Self::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                codes::API_PERMISSION_DENIED,
                msg.clone(),
                None,
            ),
            Self::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::ISE_INTERNAL_ERROR,
                msg.clone(),
                None,
            ),
            Self::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::ISE_INTERNAL_ERROR,
                e.to_string(),
                None,
            ),
            Self::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                codes::RATE_LIMIT_EXCEEDED,
                "rate limit exceeded".to_owned(),
                Some(*retry_after),
            ),
            Self::Gateway(e) => (
                StatusCode::from_u16(e.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.error_code(),
                e.to_string(),
                None,
            ),
        };

        let body = ErrorBody::new(code, message);
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(retry) = retry_after {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_credentials_surface_auth001() {
        let response =
            ServerError::MissingCredentials("username or email required".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_of(response).await;
        assert_eq!(body["error_code"], "AUTH001");
    }

    #[tokio::test]
    async fn bad_credentials_surface_auth002() {
        let response =
            ServerError::Unauthorized("invalid username or password".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_of(response).await;
        assert_eq!(body["error_code"], "AUTH002");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ServerError::RateLimited { retry_after: 30 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(axum::http::header::RETRY_AFTER).unwrap(),
            "30"
        );
    }

    #[test]
    fn gateway_error_status_passes_through() {
        let response =
            ServerError::Gateway(doorman_gateway::GatewayError::BodyTooLarge).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
