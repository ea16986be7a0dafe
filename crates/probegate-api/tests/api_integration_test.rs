//! Integration tests for the provisioning and fleet endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use probegate_api::{ApiServer, ApiServerConfig, AppState};
use probegate_control::{
    AllocatorConfig, AuthorizedKeysFile, LifecycleConfig, LifecycleController, PortAllocationService,
    ProbeError, Prober, SeaOrmRegistry,
};
use probegate_tunnel::{TunnelControl, TunnelError, TunnelState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt; // For `oneshot` method

struct AlwaysUp;

#[async_trait]
impl Prober for AlwaysUp {
    async fn probe(&self, _port: u16) -> Result<(), ProbeError> {
        Ok(())
    }
}

struct NoTunnels;

#[async_trait]
impl TunnelControl for NoTunnels {
    async fn stop(&self, _port: u16) -> Result<(), TunnelError> {
        Ok(())
    }

    async fn state(&self, _port: u16) -> Option<TunnelState> {
        None
    }
}

struct TestApp {
    router: Router,
    registry: SeaOrmRegistry,
    keys_path: std::path::PathBuf,
    _temp: TempDir,
}

/// Helper to build the API over an in-memory registry with migrations applied
async fn create_test_app() -> TestApp {
    let db = probegate_registry_db::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    probegate_registry_db::migrate(&db)
        .await
        .expect("Failed to run migrations");

    let temp = TempDir::new().unwrap();
    let keys_path = temp.path().join("authorized_keys");

    let registry = SeaOrmRegistry::new(db);
    let shared: Arc<SeaOrmRegistry> = Arc::new(registry.clone());
    let credentials = Arc::new(AuthorizedKeysFile::new(&keys_path));

    let allocator = Arc::new(PortAllocationService::new(shared.clone(), AllocatorConfig::default()));
    let lifecycle = Arc::new(LifecycleController::new(
        shared.clone(),
        Arc::new(AlwaysUp),
        Arc::new(NoTunnels),
        credentials.clone(),
        LifecycleConfig::default(),
    ));

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            enable_cors: false,
        },
        AppState {
            allocator,
            lifecycle,
            registry: shared,
            credentials,
        },
    );

    TestApp {
        router: server.build_router(),
        registry,
        keys_path,
        _temp: temp,
    }
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_request_port_scenario() {
    let app = create_test_app().await;

    let (status, body) = call(&app.router, get("/provision/request-port?mac=AA-BB-CC-DD-EE-FF")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["port"], 10001);
    assert_eq!(body["status"], "new");
    assert_eq!(body["mac"], "aa:bb:cc:dd:ee:ff");
    assert_eq!(body["device_name"], "probe-aabbccddeeff");

    let (_, body) = call(&app.router, get("/provision/request-port?mac=aa:bb:cc:dd:ee:ff")).await;
    assert_eq!(body["port"], 10001);
    assert_eq!(body["status"], "existing");

    let (_, body) = call(&app.router, get("/provision/request-port?mac=11:22:33:44:55:66")).await;
    assert_eq!(body["port"], 10002);
    assert_eq!(body["status"], "new");
}

#[tokio::test]
async fn test_request_port_rejects_bad_mac() {
    let app = create_test_app().await;

    let (status, body) = call(&app.router, get("/provision/request-port")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_MAC");

    let (status, _) = call(&app.router, get("/provision/request-port?mac=not-a-mac")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let app = create_test_app().await;
    let (status, body) = call(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    app.registry.connection().clone().close().await.unwrap();

    let (status, body) = call(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, json!({"status": "error"}));

    let (status, body) = call(&app.router, get("/provision/request-port?mac=aa:bb:cc:dd:ee:ff")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "REGISTRY_UNAVAILABLE");
}

#[tokio::test]
async fn test_register_installs_key_and_lists_device() {
    let app = create_test_app().await;
    call(&app.router, get("/provision/request-port?mac=aa:bb:cc:dd:ee:ff")).await;

    let (status, body) = call(
        &app.router,
        post_json(
            "/provision/register",
            json!({
                "mac": "aa:bb:cc:dd:ee:ff",
                "tenant": "acme",
                "site": "hq",
                "public_key": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGqk root@probe"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["tenant"], "acme");

    let keys = std::fs::read_to_string(&app.keys_path).unwrap();
    assert!(keys.contains("permitlisten=\"localhost:10001\""));
    assert!(keys.trim_end().ends_with("probe-aabbccddeeff"));

    let (status, body) = call(&app.router, get("/api/devices?tenant=acme&status=active")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["devices"][0]["mac"], "aa:bb:cc:dd:ee:ff");

    let (status, _) = call(&app.router, get("/api/devices?status=sleeping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_register_with_malformed_key_changes_nothing() {
    let app = create_test_app().await;
    call(&app.router, get("/provision/request-port?mac=aa:bb:cc:dd:ee:ff")).await;

    let (status, body) = call(
        &app.router,
        post_json(
            "/provision/register",
            json!({
                "mac": "aa:bb:cc:dd:ee:ff",
                "tenant": "acme",
                "public_key": "rsa NOT$B64"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PUBLIC_KEY");

    let (_, body) = call(&app.router, get("/api/devices/aa:bb:cc:dd:ee:ff")).await;
    assert_eq!(body["status"], "pending");
    assert!(body["tenant"].is_null());
    assert!(!app.keys_path.exists());
}

#[tokio::test]
async fn test_register_unknown_mac_is_not_found() {
    let app = create_test_app().await;
    let (status, body) = call(
        &app.router,
        post_json("/provision/register", json!({"mac": "aa:bb:cc:dd:ee:ff", "tenant": "acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "DEVICE_NOT_FOUND");
}

#[tokio::test]
async fn test_kill_switch_endpoint() {
    let app = create_test_app().await;
    call(&app.router, get("/provision/request-port?mac=aa:bb:cc:dd:ee:ff")).await;

    let (status, body) = call(&app.router, post_json("/api/kill-switch", json!({"port": 10001}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], json!(["aa:bb:cc:dd:ee:ff"]));
    assert_eq!(body["selector"], "port=10001");

    let (_, body) = call(&app.router, get("/api/devices/aa:bb:cc:dd:ee:ff")).await;
    assert_eq!(body["status"], "decommissioned");

    let (status, body) = call(&app.router, post_json("/api/heartbeat/sweep", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["probed"], 0);

    let (status, body) = call(
        &app.router,
        post_json("/api/kill-switch", json!({"port": 10001, "tenant": "acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SELECTOR");
}

#[tokio::test]
async fn test_openapi_document() {
    let app = create_test_app().await;
    let (status, body) = call(&app.router, get("/api/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/provision/request-port"].is_object());
    assert!(body["paths"]["/api/kill-switch"].is_object());
}
