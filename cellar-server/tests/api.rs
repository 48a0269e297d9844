use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cellar_core::audit::MemoryAuditSink;
use cellar_core::crypto::{DataKey, KeyEncryptionKey};
use cellar_core::error::CResult;
use cellar_core::facade::Database;
use cellar_core::store::Store;
use cellar_server::identity::{Identity, IdentityOracle, SECRETS_CAPABILITY_KEY};
use cellar_server::{build_router, AppState, NO_BROWSERS_HEADER, NO_BROWSERS_VALUE};
use serde_json::json;
use tower::ServiceExt;

struct LocalKek(DataKey);

impl KeyEncryptionKey for LocalKek {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        self.0.seal(plaintext, aad)
    }
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> CResult<Vec<u8>> {
        self.0.open(ciphertext, aad)
    }
}

struct GrantAllIdentityOracle;

impl IdentityOracle for GrantAllIdentityOracle {
    fn resolve(&self, remote_addr: &str) -> CResult<Identity> {
        let mut capability_map = std::collections::HashMap::new();
        capability_map.insert(
            SECRETS_CAPABILITY_KEY.to_string(),
            vec![json!({
                "principal": ["tag:test"],
                "action": ["get", "info", "put", "activate", "delete", "create-version"],
                "secret": ["*"],
            })],
        );
        Ok(Identity {
            node_name: remote_addr.to_string(),
            tags: vec!["tag:test".to_string()],
            user_login: None,
            capability_map,
        })
    }
}

fn app() -> (tempfile::TempDir, axum::Router) {
    let dir = tempfile::tempdir().unwrap();
    let kek = LocalKek(DataKey::generate());
    let store = Store::open(dir.path().join("db.json"), &kek).unwrap();
    let db = Arc::new(Database::new(store, Arc::new(MemoryAuditSink::new())));
    let state = AppState {
        db,
        identity: Arc::new(GrantAllIdentityOracle),
    };
    (dir, build_router(state))
}

fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(NO_BROWSERS_HEADER, NO_BROWSERS_VALUE)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let (_dir, app) = app();

    let resp = app
        .clone()
        .oneshot(post_json("/api/put", json!({"Name": "a", "Value": "VjE="})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(post_json("/api/get", json!({"Name": "a", "Version": 0, "UpdateIfChanged": false})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["Version"], 1);
}

#[tokio::test]
async fn missing_csrf_header_is_forbidden() {
    let (_dir, app) = app();
    let req = Request::builder()
        .method("POST")
        .uri("/api/list")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn get_of_missing_secret_is_not_found() {
    let (_dir, app) = app();
    let resp = app
        .oneshot(post_json("/api/get", json!({"Name": "missing", "Version": 0, "UpdateIfChanged": false})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn conditional_get_reports_not_modified() {
    let (_dir, app) = app();

    app.clone()
        .oneshot(post_json("/api/put", json!({"Name": "t", "Value": "AQ=="})))
        .await
        .unwrap();

    let resp = app
        .oneshot(post_json(
            "/api/get",
            json!({"Name": "t", "Version": 1, "UpdateIfChanged": true}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn healthz_does_not_require_csrf_header() {
    let (_dir, app) = app();
    let req = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_method_on_an_api_route_is_bad_request_not_method_not_allowed() {
    let (_dir, app) = app();
    let req = Request::builder()
        .method("GET")
        .uri("/api/list")
        .header("content-type", "application/json")
        .header(NO_BROWSERS_HEADER, NO_BROWSERS_VALUE)
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_name_put_is_bad_request() {
    let (_dir, app) = app();
    let resp = app
        .oneshot(post_json("/api/put", json!({"Name": "", "Value": "AQ=="})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
