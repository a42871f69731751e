//! GraphQL passthrough.
//!
//! The inbound `{query, variables, operationName}` body is forwarded
//! verbatim to `/graphql` on the selected server; `X-API-Version` carries
//! the resolved version. The response is returned as-is.

use std::sync::LazyLock;

use regex::Regex;

use doorman_core::Api;

use crate::balancer::ServerSelection;
use crate::context::GatewayContext;
use crate::error::GatewayError;

use super::{UpstreamRequest, UpstreamResponse, convert_response, is_hop_by_hop, map_reqwest_error};

static OPERATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:query|mutation|subscription)\s+(\w+)").expect("valid regex")
});

/// Extract the operation name from a request body: the explicit
/// `operationName` field wins, otherwise the first named operation in the
/// document.
#[must_use]
pub fn operation_name(body: &serde_json::Value) -> Option<String> {
    if let Some(name) = body.get("operationName").and_then(|v| v.as_str())
        && !name.is_empty()
    {
        return Some(name.to_owned());
    }
    let query = body.get("query")?.as_str()?;
    OPERATION_RE
        .captures(query)
        .map(|caps| caps[1].to_owned())
}

pub(super) async fn dispatch(
    ctx: &GatewayContext,
    api: &Api,
    selection: &ServerSelection,
    request: &UpstreamRequest,
) -> Result<UpstreamResponse, GatewayError> {
    let url = format!("{}/graphql", selection.server);

    let mut builder = ctx
        .http
        .post(url)
        .timeout(ctx.config().request_timeout)
        .header("content-type", "application/json")
        .header("x-api-version", &api.api_version);

    for (name, value) in &request.headers {
        if !is_hop_by_hop(name) && name != "content-type" {
            builder = builder.header(name, value);
        }
    }
    for (name, value) in &selection.extra_headers {
        builder = builder.header(name, value);
    }

    let response = builder
        .body(request.body.clone())
        .send()
        .await
        .map_err(|e| map_reqwest_error(&e))?;
    convert_response(response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_operation_name_wins() {
        let body = json!({
            "query": "query listUsers { users { id } }",
            "operationName": "picked"
        });
        assert_eq!(operation_name(&body).as_deref(), Some("picked"));
    }

    #[test]
    fn name_extracted_from_document() {
        let body = json!({"query": "mutation createUser($u: U!) { createUser(u: $u) { id } }"});
        assert_eq!(operation_name(&body).as_deref(), Some("createUser"));
    }

    #[test]
    fn anonymous_operation_has_no_name() {
        let body = json!({"query": "{ users { id } }"});
        assert_eq!(operation_name(&body), None);
    }
}
