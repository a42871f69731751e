use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;

use doorman_auth::hash_password;
use doorman_core::{Api, ApiType, Endpoint, User};
use doorman_gateway::GatewayContext;
use doorman_gateway::audit::MemoryAuditSink;
use doorman_gateway::pipeline::Gateway;
use doorman_server::app::{AppState, build_router};
use doorman_server::config::Settings;
use doorman_state_memory::MemorySharedStore;
use doorman_store::{ConfigStoreExt, MemoryConfigStore, collections};

// -- Helpers ----------------------------------------------------------------

/// Minimal canned upstream; answers every request with the same response.
async fn spawn_upstream(status: u16, body: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_task = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            hits_task.fetch_add(1, Ordering::SeqCst);
            let mut buf = vec![0u8; 8_192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (addr, hits)
}

struct Fixture {
    state: AppState,
    ctx: Arc<GatewayContext>,
    audit: Arc<MemoryAuditSink>,
}

fn fixture_with_settings(mut settings: Settings) -> Fixture {
    settings.crypto.mem_encryption_key = Some("66".repeat(32));
    let master_key =
        doorman_crypto::parse_master_key(settings.crypto.mem_encryption_key.as_ref().unwrap())
            .unwrap();

    let audit = Arc::new(MemoryAuditSink::default());
    let ctx = Arc::new(
        GatewayContext::new(
            Arc::new(MemoryConfigStore::new()),
            Arc::new(MemorySharedStore::new()),
            master_key,
            "server-test-secret",
            15,
            7,
            None,
            settings.gateway_config(),
        )
        .with_audit(audit.clone()),
    );

    let state = AppState {
        gateway: Arc::new(Gateway::new(ctx.clone())),
        settings: Arc::new(settings),
    };
    Fixture { state, ctx, audit }
}

fn fixture() -> Fixture {
    fixture_with_settings(Settings::default())
}

fn public_api(name: &str, server: &str) -> Api {
    Api {
        api_name: name.into(),
        api_version: "v1".into(),
        api_id: format!("api-{name}"),
        api_type: ApiType::Rest,
        active: true,
        api_servers: vec![server.to_owned()],
        api_allowed_retry_count: 0,
        api_allowed_roles: BTreeSet::new(),
        api_allowed_groups: BTreeSet::from(["ALL".to_owned()]),
        api_public: true,
        api_credits_enabled: false,
        api_credit_group: None,
        api_ip_allow: vec![],
        api_ip_deny: vec![],
        api_ip_mode: None,
        api_country_deny: vec![],
        api_cors_allow_origins: vec![],
        api_wsdl_url: None,
        api_grpc_package: None,
        api_openapi_url: None,
        api_transforms: None,
        dynamic_attributes: std::collections::BTreeMap::new(),
        created_at: None,
    }
}

fn ping_endpoint(api: &Api) -> Endpoint {
    Endpoint {
        endpoint_id: format!("{}-ping", api.api_id),
        api_name: api.api_name.clone(),
        api_version: api.api_version.clone(),
        endpoint_method: "GET".into(),
        endpoint_uri: "/ping".into(),
        endpoint_description: None,
        endpoint_soap_action: None,
        endpoint_soap_security: None,
        validation_schema_id: None,
        endpoint_transforms: None,
    }
}

/// Build a request carrying the peer address extension the router needs.
fn request(method: &str, path: &str, body: Body) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .body(body)
        .unwrap();
    let peer: SocketAddr = "198.51.100.7:40000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// -- Tests ------------------------------------------------------------------

#[tokio::test]
async fn liveness_is_public() {
    let f = fixture();
    let response = build_router(f.state)
        .oneshot(request("GET", "/monitor/liveness", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "alive");
}

#[tokio::test]
async fn readiness_minimal_without_admin_token() {
    let f = fixture();
    let response = build_router(f.state)
        .oneshot(request("GET", "/monitor/readiness", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
    assert!(body.get("details").is_none(), "details need manage_gateway");
}

#[tokio::test]
async fn public_rest_roundtrip_through_router() {
    let (upstream, hits) = spawn_upstream(200, r#"{"ok":true}"#).await;
    let f = fixture();
    let api = public_api("echo", &upstream);
    f.ctx.store.put_one(collections::APIS, &api).await.unwrap();
    f.ctx
        .store
        .put_one(collections::ENDPOINTS, &ping_endpoint(&api))
        .await
        .unwrap();

    let response = build_router(f.state)
        .oneshot(request("GET", "/api/rest/echo/v1/ping", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn declared_content_length_over_cap_is_413() {
    let mut settings = Settings::default();
    settings.limits.max_body_size_bytes = 1_024;
    let f = fixture_with_settings(settings);

    let mut req = request("POST", "/api/rest/echo/v1/ping", Body::empty());
    req.headers_mut()
        .insert("content-length", "2048".parse().unwrap());

    let response = build_router(f.state).oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "REQ001");
}

#[tokio::test]
async fn streamed_body_over_cap_aborts_with_audit_and_no_upstream_call() {
    let (upstream, hits) = spawn_upstream(200, "{}").await;
    let mut settings = Settings::default();
    settings.limits.max_body_size_bytes = 1_024;
    let f = fixture_with_settings(settings);
    let api = public_api("echo", &upstream);
    f.ctx.store.put_one(collections::APIS, &api).await.unwrap();
    f.ctx
        .store
        .put_one(collections::ENDPOINTS, &ping_endpoint(&api))
        .await
        .unwrap();

    // 2048 bytes streamed in chunks with a spoofed tiny Content-Length:
    // the streaming guard, not the header, must trip.
    let chunks: Vec<Result<_, std::io::Error>> =
        vec![Ok(vec![0u8; 1_024]), Ok(vec![0u8; 1_024])];
    let stream_body = Body::from_stream(futures::stream::iter(chunks));
    let mut req = request("POST", "/api/rest/echo/v1/ping", stream_body);
    req.headers_mut()
        .insert("content-length", "100".parse().unwrap());

    let response = build_router(f.state).oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "REQ001");

    assert_eq!(hits.load(Ordering::SeqCst), 0, "no upstream call");
    let events = f.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, "failure");
    assert!(events[0].details.as_deref().unwrap_or("").contains("cap"));
}

#[tokio::test]
async fn body_exactly_at_cap_is_accepted() {
    let (upstream, hits) = spawn_upstream(200, "{}").await;
    let mut settings = Settings::default();
    settings.limits.max_body_size_bytes = 1_024;
    let f = fixture_with_settings(settings);
    let api = public_api("echo", &upstream);
    f.ctx.store.put_one(collections::APIS, &api).await.unwrap();
    let mut endpoint = ping_endpoint(&api);
    endpoint.endpoint_method = "POST".into();
    f.ctx
        .store
        .put_one(collections::ENDPOINTS, &endpoint)
        .await
        .unwrap();

    let req = request(
        "POST",
        "/api/rest/echo/v1/ping",
        Body::from(vec![b'x'; 1_024]),
    );
    let response = build_router(f.state).oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_logout_flow_revokes_token() {
    let f = fixture();
    let user = User {
        username: "alice".into(),
        email: "alice@example.com".into(),
        password_hash: hash_password("s3cret").unwrap(),
        role: "client".into(),
        groups: vec!["ALL".into()],
        active: true,
        ui_access: false,
        tier: None,
        rate_limit_enabled: false,
        rate_limit_duration: None,
        rate_limit_duration_type: None,
        throttle_enabled: false,
        throttle_duration: None,
        throttle_duration_type: None,
        throttle_wait_duration: None,
        throttle_wait_duration_type: None,
        throttle_queue_limit: None,
        created_at: None,
    };
    f.ctx.store.put_one(collections::USERS, &user).await.unwrap();

    let router = build_router(f.state);

    // Login with username + password.
    let mut login = request(
        "POST",
        "/auth/login",
        Body::from(r#"{"username":"alice","password":"s3cret"}"#),
    );
    login
        .headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    let response = router.clone().oneshot(login).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_owned();
    assert!(cookie.contains("access_token_cookie="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    let body = body_json(response).await;
    let token = body["access_token"].as_str().unwrap().to_owned();
    assert!(body["refresh_token"].is_string());

    // Logout blacklists the jti.
    let mut logout = request("POST", "/auth/logout", Body::empty());
    logout.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    let response = router.clone().oneshot(logout).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let claims = f.ctx.tokens.verify(&token).unwrap();
    assert!(
        f.ctx
            .blacklist
            .is_blacklisted(&claims.sub, &claims.jti)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn wrong_password_is_401_without_detail() {
    let f = fixture();
    let user = User {
        username: "alice".into(),
        email: "alice@example.com".into(),
        password_hash: hash_password("right").unwrap(),
        role: "client".into(),
        groups: vec![],
        active: true,
        ui_access: false,
        tier: None,
        rate_limit_enabled: false,
        rate_limit_duration: None,
        rate_limit_duration_type: None,
        throttle_enabled: false,
        throttle_duration: None,
        throttle_duration_type: None,
        throttle_wait_duration: None,
        throttle_wait_duration_type: None,
        throttle_queue_limit: None,
        created_at: None,
    };
    f.ctx.store.put_one(collections::USERS, &user).await.unwrap();

    let router = build_router(f.state);
    for payload in [
        r#"{"username":"alice","password":"wrong"}"#,
        r#"{"username":"ghost","password":"any"}"#,
    ] {
        let mut login = request("POST", "/auth/login", Body::from(payload));
        login
            .headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        let response = router.clone().oneshot(login).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error_message"], "invalid username or password");
    }
}

#[tokio::test]
async fn login_without_identifier_is_auth001() {
    let f = fixture();
    let router = build_router(f.state);

    let mut login = request("POST", "/auth/login", Body::from(r#"{"password":"x"}"#));
    login
        .headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    let response = router.oneshot(login).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "AUTH001");
}

#[tokio::test]
async fn login_is_ip_rate_limited() {
    let mut settings = Settings::default();
    settings.gateway.ip_rate_limit = 2;
    settings.gateway.ip_rate_window_secs = 60;
    let f = fixture_with_settings(settings);

    let router = build_router(f.state);
    let mut last_status = StatusCode::OK;
    for _ in 0..3 {
        let mut login = request(
            "POST",
            "/auth/login",
            Body::from(r#"{"username":"nobody","password":"x"}"#),
        );
        login
            .headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        last_status = router.clone().oneshot(login).await.unwrap().status();
    }
    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
}
