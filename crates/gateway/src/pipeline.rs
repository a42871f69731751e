//! The per-request gateway state machine.
//!
//! Fourteen linear steps from ingress to response. Every step can
//! terminate the request with a structured error; nothing continues past
//! a terminal state. Client cancellation propagates into the dispatcher
//! through the request's `CancellationToken`.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use doorman_core::{Api, ApiType, AuthClaims, Endpoint, ErrorBody, StrictEnvelope};

use crate::authorization::{self, AuthzInput};
use crate::context::GatewayContext;
use crate::credits::CreditGrant;
use crate::error::GatewayError;
use crate::lookup;
use crate::metrics::RequestRecord;
use crate::ratelimit::RateLimitHeaders;
use crate::transform;
use crate::upstream::{self, UpstreamRequest, graphql};
use crate::validation;

/// Header carrying the version for GraphQL/gRPC calls.
pub const API_VERSION_HEADER: &str = "x-api-version";
/// Header selecting a routing override.
pub const CLIENT_KEY_HEADER: &str = "client-key";

/// The request as the server hands it to the pipeline: body fully read
/// (and size-capped), token already extracted from bearer or cookie.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub request_id: String,
    /// Upper-case HTTP method.
    pub method: String,
    /// Full path, e.g. `/api/rest/echo/v1/ping`.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub client_ip: IpAddr,
    /// Raw token from the bearer header or the access-token cookie.
    pub token: Option<String>,
}

/// The response handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// What a successfully dispatched request carries to the respond step.
struct PipelineOutput {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Bytes,
    rate_headers: Option<RateLimitHeaders>,
    cors_origins: Vec<String>,
}

/// Metrics context accumulated while the pipeline runs.
struct Observed {
    username: String,
    api_key: String,
    endpoint_uri: String,
}

impl Observed {
    fn new() -> Self {
        Self {
            username: "anonymous".to_owned(),
            api_key: "unresolved".to_owned(),
            endpoint_uri: String::new(),
        }
    }
}

/// The gateway orchestrator.
pub struct Gateway {
    ctx: Arc<GatewayContext>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

/// Parsed `/api/{type}/{name}/{version}{rest}` form.
#[derive(Debug, PartialEq, Eq)]
struct ParsedPath {
    api_type: ApiType,
    name: String,
    version: Option<String>,
    rest: String,
}

fn parse_api_path(path: &str) -> Result<ParsedPath, GatewayError> {
    let rest = path
        .strip_prefix("/api/")
        .ok_or(GatewayError::ApiNotFound)?;
    let mut segments = rest.splitn(2, '/');
    let type_segment = segments.next().unwrap_or_default();
    let api_type = ApiType::from_path_segment(type_segment).ok_or(GatewayError::ApiNotFound)?;
    let remainder = segments.next().unwrap_or_default();

    match api_type {
        ApiType::Rest | ApiType::Soap => {
            let mut parts = remainder.splitn(3, '/');
            let name = parts.next().unwrap_or_default();
            let version = parts.next().unwrap_or_default();
            if name.is_empty() || version.is_empty() {
                return Err(GatewayError::ApiNotFound);
            }
            let tail = parts.next().unwrap_or_default();
            Ok(ParsedPath {
                api_type,
                name: name.to_owned(),
                version: Some(version.to_owned()),
                rest: format!("/{tail}"),
            })
        }
        ApiType::Graphql | ApiType::Grpc => {
            let name = remainder.trim_end_matches('/');
            if name.is_empty() || name.contains('/') {
                return Err(GatewayError::ApiNotFound);
            }
            Ok(ParsedPath {
                api_type,
                name: name.to_owned(),
                version: None,
                rest: String::new(),
            })
        }
    }
}

/// Map a tier reset frequency onto a quota period. Weekly tiers share the
/// monthly counter; `Never` disables IO quotas entirely.
fn quota_period(freq: doorman_core::ResetFrequency) -> Option<crate::quota::QuotaPeriod> {
    match freq {
        doorman_core::ResetFrequency::Daily => Some(crate::quota::QuotaPeriod::Day),
        doorman_core::ResetFrequency::Weekly | doorman_core::ResetFrequency::Monthly => {
            Some(crate::quota::QuotaPeriod::Month)
        }
        doorman_core::ResetFrequency::Never => None,
    }
}

/// Synthetic endpoint for the single-route protocols.
fn synthetic_endpoint(api: &Api, uri: &str) -> Endpoint {
    Endpoint {
        endpoint_id: format!("{}:{uri}", api.api_id),
        api_name: api.api_name.clone(),
        api_version: api.api_version.clone(),
        endpoint_method: "POST".to_owned(),
        endpoint_uri: uri.to_owned(),
        endpoint_description: None,
        endpoint_soap_action: None,
        endpoint_soap_security: None,
        validation_schema_id: None,
        endpoint_transforms: None,
    }
}

impl Gateway {
    #[must_use]
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Run a request through the pipeline and produce the final response
    /// envelope. Metrics record regardless of outcome; cancellation maps
    /// to the synthetic 499 status.
    #[instrument(skip(self, request, cancel), fields(request_id = %request.request_id, path = %request.path))]
    pub async fn handle(
        &self,
        request: GatewayRequest,
        cancel: CancellationToken,
    ) -> GatewayResponse {
        let started = std::time::Instant::now();
        let mut observed = Observed::new();
        let bytes_in = request.body.len() as u64;
        let strict = self.ctx.config().strict_envelope;

        let outcome = self.run(&request, &cancel, &mut observed).await;

        let response = match outcome {
            Ok(output) => {
                let mut response = GatewayResponse {
                    status: output.status,
                    headers: output.headers,
                    body: output.body,
                };
                if let Some(rate) = output.rate_headers {
                    response
                        .headers
                        .insert("x-ratelimit-limit".into(), rate.limit.to_string());
                    response
                        .headers
                        .insert("x-ratelimit-remaining".into(), rate.remaining.to_string());
                    response
                        .headers
                        .insert("x-ratelimit-reset".into(), rate.reset.to_string());
                }
                if !output.cors_origins.is_empty() {
                    let origin = request.headers.get("origin").cloned();
                    let allowed = origin
                        .filter(|o| {
                            output.cors_origins.iter().any(|a| a == "*" || a == o)
                        })
                        .or_else(|| {
                            output
                                .cors_origins
                                .iter()
                                .find(|a| *a == "*")
                                .cloned()
                        });
                    if let Some(allowed) = allowed {
                        response
                            .headers
                            .insert("access-control-allow-origin".into(), allowed);
                    }
                }
                response
            }
            Err(error) => {
                let status = error.status_code();
                if status >= 500 {
                    warn!(request_id = %request.request_id, %error, "request failed");
                }
                let body = ErrorBody::new(error.error_code(), error.to_string());
                let mut headers = BTreeMap::new();
                headers.insert("content-type".into(), "application/json".into());
                if let GatewayError::RateLimited {
                    retry_after,
                    limit,
                    remaining,
                    reset,
                } = &error
                {
                    headers.insert("retry-after".into(), retry_after.to_string());
                    headers.insert("x-ratelimit-limit".into(), limit.to_string());
                    headers.insert("x-ratelimit-remaining".into(), remaining.to_string());
                    headers.insert("x-ratelimit-reset".into(), reset.to_string());
                }
                GatewayResponse {
                    status,
                    headers,
                    body: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
                }
            }
        };

        let mut response = if strict {
            wrap_strict(response)
        } else {
            response
        };
        response
            .headers
            .insert("x-request-id".into(), request.request_id.clone());

        #[allow(clippy::cast_precision_loss)]
        self.ctx.metrics.record(&RequestRecord {
            status: if strict { inner_status(&response) } else { response.status },
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            username: observed.username,
            api_key: observed.api_key,
            endpoint_uri: observed.endpoint_uri,
            method: request.method.clone(),
            bytes_in,
            bytes_out: response.body.len() as u64,
        });

        response
    }

    /// Steps 3–13.
    async fn run(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
        observed: &mut Observed,
    ) -> Result<PipelineOutput, GatewayError> {
        let ctx = &*self.ctx;

        // -- Identify: try, never throw. -----------------------------------
        let (claims, auth_error) = self.identify(request).await;
        if let Some(claims) = &claims {
            observed.username.clone_from(&claims.sub);
        }

        // -- Resolve API. ---------------------------------------------------
        let parsed = parse_api_path(&request.path)?;
        let version = match &parsed.version {
            Some(version) => version.clone(),
            None => request
                .headers
                .get(API_VERSION_HEADER)
                .cloned()
                .ok_or(GatewayError::ApiNotFound)?,
        };
        let api = lookup::resolve_api(&ctx.cache, ctx.store.as_ref(), &parsed.name, &version)
            .await?;
        observed.api_key = format!("{}:{}", parsed.api_type, api.api_name);

        // -- Match endpoint. ------------------------------------------------
        let endpoint = match parsed.api_type {
            ApiType::Rest | ApiType::Soap => {
                lookup::resolve_endpoint(
                    &ctx.cache,
                    ctx.store.as_ref(),
                    &api,
                    &request.method,
                    &parsed.rest,
                )
                .await?
            }
            ApiType::Graphql => synthetic_endpoint(&api, "/graphql"),
            ApiType::Grpc => synthetic_endpoint(&api, "/grpc"),
        };
        observed.endpoint_uri.clone_from(&endpoint.endpoint_uri);

        // -- Authorize. -----------------------------------------------------
        // A private API with a broken token surfaces the identify failure.
        if !api.api_public && claims.is_none() {
            return Err(auth_error.unwrap_or(GatewayError::TokenMissing));
        }

        let user = match &claims {
            Some(claims) => {
                lookup::resolve_user(&ctx.cache, ctx.store.as_ref(), &claims.sub).await?
            }
            None => None,
        };
        let role = match &claims {
            Some(claims) => {
                lookup::resolve_role(&ctx.cache, ctx.store.as_ref(), &claims.role).await?
            }
            None => None,
        };
        let user_groups = user
            .as_ref()
            .map(doorman_core::User::effective_groups)
            .unwrap_or_default();
        let group_defs =
            lookup::resolve_groups(&ctx.cache, ctx.store.as_ref(), &user_groups).await?;
        let subscription = match &claims {
            Some(claims) => {
                lookup::resolve_subscription(&ctx.cache, ctx.store.as_ref(), &claims.sub).await?
            }
            None => None,
        };
        let country = ctx.geo.country_for(request.client_ip);

        authorization::authorize(&AuthzInput {
            api: &api,
            claims: claims.as_ref(),
            user: user.as_ref(),
            role: role.as_ref(),
            user_groups: &user_groups,
            group_defs: &group_defs,
            subscription: subscription.as_ref(),
            client_ip: request.client_ip,
            country: country.as_deref(),
        })?;

        // -- Rate / throttle. -----------------------------------------------
        let mut rate_headers = None;
        if let Some(user) = &user {
            let decision = match &user.tier {
                Some(tier_name) => {
                    match lookup::resolve_tier(ctx.store.as_ref(), tier_name).await? {
                        Some(tier) => ctx.limiter.check_tier(&user.username, &tier).await?,
                        None => ctx.limiter.check_user(user).await?,
                    }
                }
                None => ctx.limiter.check_user(user).await?,
            };
            rate_headers = decision.headers;
            if let Some(delay) = decision.delay {
                debug!(request_id = %request.request_id, ?delay, "throttling request");
                tokio::select! {
                    () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        // -- Validate. ------------------------------------------------------
        let mut body_json = self.parse_body(&api, request)?;
        if let Some(schema_id) = &endpoint.validation_schema_id
            && let Some(schema) =
                lookup::resolve_validation_schema(&ctx.cache, ctx.store.as_ref(), schema_id)
                    .await?
        {
            match (parsed.api_type, &body_json) {
                (ApiType::Graphql, Some(body)) => {
                    let operation = graphql::operation_name(body).ok_or_else(|| {
                        GatewayError::MalformedBody("GraphQL operation name missing".into())
                    })?;
                    let variables = body
                        .get("variables")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                    validation::validate_graphql(
                        &schema.validation_schema,
                        &operation,
                        &variables,
                    )?;
                }
                (ApiType::Grpc, Some(body)) => {
                    let message = body
                        .get("message")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({}));
                    validation::validate(&schema.validation_schema, &message)?;
                }
                (_, Some(body)) => validation::validate(&schema.validation_schema, body)?,
                (_, None) => validation::validate(
                    &schema.validation_schema,
                    &serde_json::Value::Object(serde_json::Map::new()),
                )?,
            }
        }

        // -- Credit pre-deduct check. ---------------------------------------
        let grant: Option<CreditGrant> = if api.api_credits_enabled {
            let username = claims
                .as_ref()
                .map(|c| c.sub.as_str())
                .ok_or(GatewayError::TokenMissing)?;
            let grant = ctx.credits.pre_check(&ctx.cache, username, &api).await?;
            self.check_io_quotas(username, &grant, request.body.len() as u64)
                .await?;
            Some(grant)
        } else {
            None
        };

        // -- Transform in. --------------------------------------------------
        let layers = [api.api_transforms.as_ref(), endpoint.endpoint_transforms.as_ref()];
        let mut headers = request.headers.clone();
        let mut query = request.query.clone();
        transform::apply_request_layers(&layers, &mut headers, body_json.as_mut(), &mut query);

        if let Some(grant) = &grant {
            headers.insert(grant.header_name.to_lowercase(), grant.api_key.clone());
        }

        let body = match (&body_json, parsed.api_type) {
            // SOAP bodies stay XML; JSON shapes are re-serialized after
            // transforms.
            (_, ApiType::Soap) | (None, _) => request.body.clone(),
            (Some(json), _) => Bytes::from(serde_json::to_vec(json).map_err(|e| {
                GatewayError::Internal(format!("body re-encode failed: {e}"))
            })?),
        };

        // -- Dispatch. ------------------------------------------------------
        let routing = match headers.get(CLIENT_KEY_HEADER) {
            Some(client_key) => {
                lookup::resolve_routing(&ctx.cache, ctx.store.as_ref(), client_key).await?
            }
            None => None,
        };
        let upstream_request = UpstreamRequest {
            method: request.method.clone(),
            path: parsed.rest.clone(),
            query,
            headers,
            body,
        };
        let response = upstream::dispatch(
            ctx,
            &api,
            &endpoint,
            routing.as_ref(),
            &upstream_request,
            cancel,
        )
        .await?;

        // -- Transform out. -------------------------------------------------
        let mut response_headers = response.headers;
        let mut response_body_json: Option<serde_json::Value> =
            serde_json::from_slice(&response.body).ok();
        let status = transform::apply_response_layers(
            &layers,
            response.status,
            &mut response_headers,
            response_body_json.as_mut(),
        );
        let has_body_transforms = layers.iter().flatten().any(|t| {
            t.response.as_ref().is_some_and(|r| r.body.is_some())
        });
        let response_body = match (&response_body_json, has_body_transforms) {
            (Some(json), true) => Bytes::from(serde_json::to_vec(json).map_err(|e| {
                GatewayError::Internal(format!("response re-encode failed: {e}"))
            })?),
            _ => response.body,
        };

        // -- Commit. --------------------------------------------------------
        // Effective status < 500 consumed upstream quota; 5xx does not.
        if let (Some(grant), true) = (&grant, status < 500) {
            let username = observed.username.clone();
            if let Err(error) = ctx.credits.commit(&username, &grant.group).await {
                warn!(request_id = %request.request_id, %error, "credit commit failed");
            }
            self.record_io_usage(
                &username,
                grant,
                request.body.len() as u64,
                response_body.len() as u64,
            )
            .await;
        }

        Ok(PipelineOutput {
            status,
            headers: response_headers,
            body: response_body,
            rate_headers,
            cors_origins: api.api_cors_allow_origins.clone(),
        })
    }

    /// Enforce tier input/output byte quotas before dispatch. Output can
    /// only be checked against prior usage — its size is unknown until the
    /// upstream answers.
    async fn check_io_quotas(
        &self,
        username: &str,
        grant: &CreditGrant,
        bytes_in: u64,
    ) -> Result<(), GatewayError> {
        let Some(tier) = &grant.tier else {
            return Ok(());
        };
        let Some(period) = quota_period(tier.reset_frequency) else {
            return Ok(());
        };
        let checks = [
            (tier.input_limit, "input", bytes_in),
            (tier.output_limit, "output", 0),
        ];
        for (limit, direction, amount) in checks {
            let Some(limit) = limit else { continue };
            let check = self
                .ctx
                .quotas
                .check(
                    username,
                    &format!("{}:{direction}", grant.group),
                    amount,
                    limit,
                    period,
                )
                .await?;
            if !check.allowed {
                let reset = u64::try_from(
                    (check.reset_at - chrono::Utc::now()).num_seconds().max(0),
                )
                .unwrap_or(0);
                return Err(GatewayError::RateLimited {
                    retry_after: reset,
                    limit,
                    remaining: check.remaining,
                    reset,
                });
            }
        }
        Ok(())
    }

    /// Record consumed IO against the tier quotas; best effort.
    async fn record_io_usage(
        &self,
        username: &str,
        grant: &CreditGrant,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        let Some(tier) = &grant.tier else { return };
        let Some(period) = quota_period(tier.reset_frequency) else {
            return;
        };
        for (limit, direction, amount) in [
            (tier.input_limit, "input", bytes_in),
            (tier.output_limit, "output", bytes_out),
        ] {
            if limit.is_none() || amount == 0 {
                continue;
            }
            if let Err(error) = self
                .ctx
                .quotas
                .record(username, &format!("{}:{direction}", grant.group), amount, period)
                .await
            {
                warn!(%error, "quota usage record failed");
            }
        }
    }

    /// Try to identify the caller; never fail. The verification error, if
    /// any, is kept so an auth-required API can surface the real reason.
    async fn identify(
        &self,
        request: &GatewayRequest,
    ) -> (Option<AuthClaims>, Option<GatewayError>) {
        let Some(token) = &request.token else {
            return (None, None);
        };
        let claims = match self.ctx.tokens.verify(token) {
            Ok(claims) => claims,
            Err(error) => return (None, Some(error.into())),
        };
        match self
            .ctx
            .blacklist
            .is_blacklisted(&claims.sub, &claims.jti)
            .await
        {
            Ok(true) => (None, Some(GatewayError::TokenInvalid)),
            Ok(false) => (Some(claims), None),
            Err(error) => (None, Some(error.into())),
        }
    }

    /// Parse the request body by the API's declared shape. Empty bodies
    /// parse to `None`; malformed JSON on JSON-shaped protocols is a
    /// terminal `VAL001`.
    fn parse_body(
        &self,
        api: &Api,
        request: &GatewayRequest,
    ) -> Result<Option<serde_json::Value>, GatewayError> {
        if request.body.is_empty() {
            return Ok(None);
        }
        match api.api_type {
            ApiType::Rest | ApiType::Graphql | ApiType::Grpc => {
                let content_type = request
                    .headers
                    .get("content-type")
                    .map(String::as_str)
                    .unwrap_or("application/json");
                if !content_type.contains("json") {
                    // Non-JSON REST bodies pass through untouched.
                    return Ok(None);
                }
                serde_json::from_slice(&request.body)
                    .map(Some)
                    .map_err(|e| GatewayError::MalformedBody(e.to_string()))
            }
            ApiType::Soap => Ok(Some(crate::upstream::soap::body_to_json(&request.body)?)),
        }
    }
}

/// Wrap a response in the strict envelope: HTTP 200 with the real status
/// folded into the body.
fn wrap_strict(response: GatewayResponse) -> GatewayResponse {
    let envelope = match serde_json::from_slice::<ErrorBody>(&response.body) {
        Ok(error) if response.status >= 400 => StrictEnvelope::error(response.status, &error),
        _ => {
            let body: serde_json::Value = serde_json::from_slice(&response.body)
                .unwrap_or_else(|_| {
                    serde_json::Value::String(
                        String::from_utf8_lossy(&response.body).into_owned(),
                    )
                });
            StrictEnvelope::success(response.status, body)
        }
    };
    let mut headers = response.headers;
    headers.insert("content-type".into(), "application/json".into());
    GatewayResponse {
        status: 200,
        headers,
        body: Bytes::from(serde_json::to_vec(&envelope).unwrap_or_default()),
    }
}

/// Recover the folded status from a strict envelope for metrics.
fn inner_status(response: &GatewayResponse) -> u16 {
    serde_json::from_slice::<StrictEnvelope>(&response.body)
        .map(|envelope| envelope.status_code)
        .unwrap_or(response.status)
}
