//! Router assembly and the gateway proxy handler.
//!
//! Middleware order, outermost first: trace -> CORS -> handler. The body
//! cap is enforced inside the proxy handler by reading the stream
//! incrementally, so a chunked request with a spoofed `Content-Length`
//! still aborts at cap+1 bytes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Method, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use doorman_core::{AuditEvent, ErrorBody, codes};
use doorman_gateway::pipeline::{Gateway, GatewayRequest};

use crate::config::{CorsSettings, Settings};
use crate::extract;
use crate::routes;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub settings: Arc<Settings>,
}

/// Build the CORS layer from settings.
fn cors_layer(cors: &CorsSettings) -> CorsLayer {
    let mut layer = CorsLayer::new();

    layer = if cors.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    };

    let methods: Vec<Method> = cors
        .allow_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    layer = layer.allow_methods(methods);

    layer = if cors.allow_headers.iter().any(|h| h == "*") {
        layer.allow_headers(Any)
    } else {
        let headers: Vec<axum::http::HeaderName> = cors
            .allow_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer.allow_headers(headers)
    };

    if cors.allow_credentials && !cors.allowed_origins.iter().any(|o| o == "*") {
        layer = layer.allow_credentials(true);
    }
    layer
}

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/{*rest}", any(proxy))
        .nest("/auth", routes::auth::router())
        .nest("/monitor", routes::monitor::router())
        .layer(cors_layer(&state.settings.cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Decode the query string into ordered pairs.
fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(name).decode_utf8_lossy().into_owned(),
                percent_decode_str(value).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

fn lowercase_headers(parts: &Parts) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), value.to_owned());
        }
    }
    headers
}

/// Read the body up to `cap` bytes; one byte over aborts the stream.
async fn read_capped(body: Body, cap: usize) -> Result<Bytes, ()> {
    let mut stream = body.into_data_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            return Err(());
        };
        if collected.len() + chunk.len() > cap {
            return Err(());
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

fn body_too_large(request_id: &str) -> Response {
    let body = ErrorBody::new(codes::REQ_BODY_TOO_LARGE, "request body too large");
    let mut response = (
        StatusCode::PAYLOAD_TOO_LARGE,
        axum::Json(body),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// The `/api/{...}` passthrough handler.
async fn proxy(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let request_id = uuid::Uuid::new_v4().to_string();
    let path = parts.uri.path().to_owned();

    // The route family decides the effective body cap.
    let family = path
        .strip_prefix("/api/")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("")
        .to_owned();
    let cap = state.settings.limits.cap_for(&family);

    // Content-Length is only a fast path; the streaming read below is the
    // actual enforcement and covers chunked encoding.
    let declared_over = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len > cap);

    let body_bytes = if declared_over {
        Err(())
    } else {
        read_capped(body, cap).await
    };
    let Ok(body_bytes) = body_bytes else {
        warn!(request_id, path, cap, "request body exceeded cap");
        state.gateway.context().audit.record(
            AuditEvent::new("anonymous", "gateway.request", &path, "failure", &request_id)
                .with_details(format!("body exceeded {family} cap of {cap} bytes")),
        );
        return body_too_large(&request_id);
    };

    let gateway_request = GatewayRequest {
        request_id,
        method: parts.method.as_str().to_uppercase(),
        path,
        query: parse_query(parts.uri.query()),
        headers: lowercase_headers(&parts),
        body: body_bytes,
        client_ip: extract::client_ip(&parts.headers, peer.ip()),
        token: extract::extract_token(&parts.headers),
    };

    // Run the pipeline on its own task so a client disconnect (this
    // handler future being dropped) cancels the upstream attempt but the
    // pipeline still records metrics for the aborted request.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let gateway = state.gateway.clone();
    let task = tokio::spawn(async move { gateway.handle(gateway_request, cancel).await });

    let result = task.await;
    drop(guard.disarm());

    match result {
        Ok(gateway_response) => {
            let mut response = Response::builder().status(
                StatusCode::from_u16(gateway_response.status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            );
            for (name, value) in &gateway_response.headers {
                // Hop-by-hop headers from the upstream never reach the
                // client connection.
                if doorman_gateway::upstream::is_hop_by_hop(name) {
                    continue;
                }
                if let Ok(value) = HeaderValue::from_str(value) {
                    response = response.header(name, value);
                }
            }
            response
                .body(Body::from(gateway_response.body))
                .unwrap_or_else(|_| {
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                })
        }
        Err(join_error) => {
            warn!(%join_error, "gateway task failed");
            let body = ErrorBody::new(codes::ISE_INTERNAL_ERROR, "internal error");
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
        }
    }
}
