//! REST passthrough.
//!
//! Forwards the method, remaining path, query string, and body to the
//! selected server. Hop-by-hop headers never cross the gateway; routing
//! overrides may inject extra headers.

use reqwest::Method;

use crate::balancer::ServerSelection;
use crate::context::GatewayContext;
use crate::error::GatewayError;

use super::{UpstreamRequest, UpstreamResponse, convert_response, is_hop_by_hop, map_reqwest_error};

pub(super) async fn dispatch(
    ctx: &GatewayContext,
    selection: &ServerSelection,
    request: &UpstreamRequest,
) -> Result<UpstreamResponse, GatewayError> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| GatewayError::MalformedBody(format!("bad method {}", request.method)))?;
    let url = format!("{}{}", selection.server, request.path);

    let mut builder = ctx
        .http
        .request(method, url)
        .timeout(ctx.config().request_timeout);

    if !request.query.is_empty() {
        builder = builder.query(&request.query);
    }
    for (name, value) in &request.headers {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    for (name, value) in &selection.extra_headers {
        builder = builder.header(name, value);
    }
    if !request.body.is_empty() {
        builder = builder.body(request.body.clone());
    }

    let response = builder.send().await.map_err(|e| map_reqwest_error(&e))?;
    convert_response(response).await
}
