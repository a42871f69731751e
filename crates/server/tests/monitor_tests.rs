use std::sync::Arc;

use axum_test::TestServer;
use serde_json::Value;

use doorman_gateway::GatewayContext;
use doorman_gateway::pipeline::Gateway;
use doorman_server::app::{AppState, build_router};
use doorman_server::config::Settings;
use doorman_state_memory::MemorySharedStore;
use doorman_store::{ConfigStoreExt, MemoryConfigStore, collections};

fn test_state() -> AppState {
    let ctx = Arc::new(GatewayContext::new(
        Arc::new(MemoryConfigStore::new()),
        Arc::new(MemorySharedStore::new()),
        doorman_crypto::parse_master_key(&"55".repeat(32)).unwrap(),
        "monitor-test-secret",
        15,
        7,
        None,
        Settings::default().gateway_config(),
    ));
    AppState {
        gateway: Arc::new(Gateway::new(ctx)),
        settings: Arc::new(Settings::default()),
    }
}

#[tokio::test]
async fn liveness_answers_alive() {
    let server = TestServer::new(build_router(test_state())).unwrap();
    let response = server.get("/monitor/liveness").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "alive");
}

#[tokio::test]
async fn readiness_is_minimal_for_public_callers() {
    let server = TestServer::new(build_router(test_state())).unwrap();
    let response = server.get("/monitor/readiness").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ready");
    assert!(body.get("details").is_none());
}

#[tokio::test]
async fn readiness_details_for_manage_gateway_role() {
    let state = test_state();
    let ctx = state.gateway.context().clone();

    // An ops role with manage_gateway unlocks the detailed body.
    let mut role = doorman_core::Role::default();
    role.role_name = "ops".into();
    role.manage_gateway = true;
    ctx.store.put_one(collections::ROLES, &role).await.unwrap();
    let token = ctx.tokens.issue("opsuser", "ops", false).unwrap().token;

    let server = TestServer::new(build_router(state)).unwrap();
    let response = server
        .get("/monitor/readiness")
        .add_header(
            axum::http::HeaderName::from_static("authorization"),
            axum::http::HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        )
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ready");
    assert!(body["details"]["cache"].is_string());
}
