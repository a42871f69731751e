//! Protocol-specific upstream dispatch.
//!
//! One outbound request per gateway request, with load balancing, retry,
//! and circuit breaking handled here; the per-protocol modules hold all
//! wire knowledge. An attempt is retriable on connect failure, timeout,
//! or a 502/503/504; other statuses (including 4xx) return immediately.

pub mod graphql;
pub mod grpc;
pub mod rest;
pub mod soap;

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use doorman_core::{Api, ApiType, Endpoint, Routing};

use crate::balancer::{self, ServerSelection};
use crate::context::GatewayContext;
use crate::error::GatewayError;

/// Headers never forwarded upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// The outbound request as the dispatcher sees it: transforms applied,
/// credit key attached, gateway prefix stripped from the path.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    /// Path relative to the upstream root (e.g. `/ping`).
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// What came back from the upstream.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// 502/503/504 are retriable; other definite statuses are not.
#[must_use]
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_lowercase().as_str())
}

fn is_retriable_error(error: &GatewayError) -> bool {
    matches!(
        error,
        GatewayError::UpstreamConnect(_) | GatewayError::UpstreamTimeout
    )
}

async fn dispatch_once(
    ctx: &GatewayContext,
    api: &Api,
    endpoint: &Endpoint,
    selection: &ServerSelection,
    request: &UpstreamRequest,
) -> Result<UpstreamResponse, GatewayError> {
    match api.api_type {
        ApiType::Rest => rest::dispatch(ctx, selection, request).await,
        ApiType::Soap => soap::dispatch(ctx, endpoint, selection, request).await,
        ApiType::Graphql => graphql::dispatch(ctx, api, selection, request).await,
        ApiType::Grpc => grpc::dispatch(ctx, api, selection, request).await,
    }
}

/// Run the attempt loop: select a server, dispatch, classify, back off.
///
/// When every attempt fails with a retriable status, the last upstream
/// response is returned verbatim — the caller sees the real status and the
/// commit step skips the credit decrement on 5xx.
pub async fn dispatch(
    ctx: &GatewayContext,
    api: &Api,
    endpoint: &Endpoint,
    routing: Option<&Routing>,
    request: &UpstreamRequest,
    cancel: &CancellationToken,
) -> Result<UpstreamResponse, GatewayError> {
    if !ctx.circuits.allow(&api.api_id) {
        return Err(GatewayError::CircuitOpen);
    }

    let config = ctx.config();
    let attempts = 1 + api.api_allowed_retry_count;
    let mut last: Option<Result<UpstreamResponse, GatewayError>> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let backoff = config.backoff_base * 2u32.saturating_pow(attempt - 1);
            tokio::select! {
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
            ctx.metrics.record_retry();
        }

        let selection = balancer::select_server(&ctx.cache, api, routing).await?;
        debug!(api = %api.api_path(), server = %selection.server, attempt, "dispatching upstream");

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = dispatch_once(ctx, api, endpoint, &selection, request) => result,
        };

        match result {
            Ok(response) if is_retriable_status(response.status) && attempt + 1 < attempts => {
                warn!(
                    api = %api.api_path(),
                    status = response.status,
                    attempt,
                    "retriable upstream status"
                );
                last = Some(Ok(response));
            }
            Ok(response) => {
                ctx.circuits.record(&api.api_id, response.status < 500);
                return Ok(response);
            }
            Err(error) if is_retriable_error(&error) && attempt + 1 < attempts => {
                if matches!(error, GatewayError::UpstreamTimeout) {
                    ctx.metrics.record_upstream_timeout();
                }
                warn!(api = %api.api_path(), %error, attempt, "retriable upstream error");
                last = Some(Err(error));
            }
            Err(error) if is_retriable_error(&error) => {
                if matches!(error, GatewayError::UpstreamTimeout) {
                    ctx.metrics.record_upstream_timeout();
                }
                ctx.circuits.record(&api.api_id, false);
                return Err(error);
            }
            Err(error) => {
                // Non-network failures (bad body, missing descriptor) are
                // the caller's problem, not upstream health.
                return Err(error);
            }
        }
    }

    ctx.circuits.record(&api.api_id, false);
    match last {
        Some(outcome) => outcome,
        None => Err(GatewayError::Internal("retry loop made no attempts".into())),
    }
}

/// Shared conversion from a `reqwest` response.
pub(crate) async fn convert_response(
    response: reqwest::Response,
) -> Result<UpstreamResponse, GatewayError> {
    let status = response.status().as_u16();
    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), value.to_owned());
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamConnect(format!("body read failed: {e}")))?;
    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

/// Shared error mapping for `reqwest` failures.
pub(crate) fn map_reqwest_error(error: &reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::UpstreamTimeout
    } else {
        GatewayError::UpstreamConnect(error.to_string())
    }
}
