mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
};
use common::{body_json, TestApp};

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_jwks_endpoint() {
    let app = TestApp::spawn();

    let response = app.send(get("/.well-known/jwks.json")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=3600");
    let body = body_json(response).await;
    let key = &body["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    assert_eq!(key["use"], "sig");
    assert_eq!(key["kid"], "test-key");
    assert_eq!(key["e"], "AQAB");
}

#[tokio::test]
async fn test_openid_configuration() {
    let app = TestApp::spawn();

    let response = app.send(get("/.well-known/openid-configuration")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["issuer"], "https://iam.test");
    assert_eq!(body["token_endpoint"], "https://iam.test/oauth/token");
    assert_eq!(body["jwks_uri"], "https://iam.test/.well-known/jwks.json");
}

#[tokio::test]
async fn test_openapi_document_served_without_swagger_ui() {
    let app = TestApp::spawn();

    let response = app.send(get("/.well-known/openapi.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["paths"]["/oauth/token"].is_object());

    let response = app.send(get("/docs")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::spawn();

    let response = app.send(get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "iam-service-test");
}

#[tokio::test]
async fn test_health_check_reports_store_outage() {
    let app = TestApp::spawn();
    app.store.set_offline(true);

    let response = app.send(get("/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = TestApp::spawn();
    app.send(get("/health")).await;

    let response = app.send(get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
}
