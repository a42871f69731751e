//! Liveness and readiness probes.
//!
//! Liveness is unauthenticated and constant. Readiness answers a minimal
//! public body; callers whose role carries `manage_gateway` get backend
//! details.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::get;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use doorman_core::{AnalyticsGranularity, AnalyticsQuery};
use doorman_gateway::lookup;
use doorman_store::{ConfigStore, Filter, collections};

use crate::app::AppState;
use crate::extract;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({"status": "alive"}))
}

/// Whether the caller's role carries `manage_gateway`.
async fn caller_manages_gateway(state: &AppState, headers: &HeaderMap) -> bool {
    let ctx = state.gateway.context();
    let Some(token) = extract::extract_token(headers) else {
        return false;
    };
    let Ok(claims) = ctx.tokens.verify(&token) else {
        return false;
    };
    if ctx
        .blacklist
        .is_blacklisted(&claims.sub, &claims.jti)
        .await
        .unwrap_or(true)
    {
        return false;
    }
    matches!(
        lookup::resolve_role(&ctx.cache, ctx.store.as_ref(), &claims.role).await,
        Ok(Some(role)) if role.manage_gateway
    )
}

async fn readiness(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let ctx = state.gateway.context();

    let cache_ok = ctx.cache.health_check().await.is_ok();
    let store_ok = ctx
        .store
        .find_list(collections::ROLES, &Filter::new())
        .await
        .is_ok();
    let status = if cache_ok && store_ok { "ready" } else { "degraded" };

    if !caller_manages_gateway(&state, &headers).await {
        return Json(json!({"status": status}));
    }

    let now = Utc::now();
    let snapshot = ctx.metrics.snapshot(&AnalyticsQuery {
        start: now - ChronoDuration::hours(1),
        end: now,
        granularity: Some(AnalyticsGranularity::Minute),
        top_n: 5,
    });

    Json(json!({
        "status": status,
        "details": {
            "cache": if cache_ok { "ok" } else { "unreachable" },
            "store": if store_ok { "ok" } else { "unreachable" },
            "requests_last_hour": snapshot.total_requests,
            "errors_last_hour": snapshot.total_errors,
            "p95_ms_last_hour": snapshot.p95_ms,
        }
    }))
}
