mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{bearer_json_request, body_json, json_request, TestApp, TEST_ADMIN_API_KEY};
use serde_json::{json, Value};

fn admin_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    let mut request = json_request(method, uri, body);
    request
        .headers_mut()
        .insert("x-admin-api-key", TEST_ADMIN_API_KEY.parse().unwrap());
    request
}

fn editor_rule(priority: i32, effect: &str) -> Value {
    json!({
        "rule_name": format!("{}-editors", effect),
        "description": null,
        "priority": priority,
        "effect": effect,
        "enabled": true,
        "conditions": [
            { "field": "role", "operator": "eq", "value": "editor" }
        ]
    })
}

#[tokio::test]
async fn test_rule_admin_requires_api_key() {
    let app = TestApp::spawn();
    let uri = format!("/applications/{}/rules", app.app.app_id);

    let response = app
        .send(json_request("POST", &uri, &editor_rule(10, "allow")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let mut wrong = json_request("GET", &uri, &json!({}));
    wrong
        .headers_mut()
        .insert("x-admin-api-key", "not-the-key".parse().unwrap());
    let response = app.send(wrong).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rule_crud_round() {
    let app = TestApp::spawn();
    let base = format!("/applications/{}/rules", app.app.app_id);

    let response = app
        .send(admin_request("POST", &base, &editor_rule(10, "allow")))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let rule_id = created["rule_id"].as_str().unwrap().to_string();
    assert_eq!(created["conditions"][0]["position"], 0);

    let response = app.send(admin_request("GET", &base, &json!({}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let item = format!("{}/{}", base, rule_id);
    let response = app
        .send(admin_request("PUT", &item, &editor_rule(20, "deny")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["priority"], 20);
    assert_eq!(updated["effect"], "deny");

    let response = app
        .send(admin_request(
            "POST",
            &format!("{}/enabled", item),
            &json!({ "enabled": false }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["enabled"], false);

    let response = app.send(admin_request("DELETE", &item, &json!({}))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.send(admin_request("GET", &item, &json!({}))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "rule_not_found");
}

#[tokio::test]
async fn test_rule_with_bad_operator_is_rejected() {
    let app = TestApp::spawn();
    let base = format!("/applications/{}/rules", app.app.app_id);

    let mut rule = editor_rule(10, "allow");
    rule["conditions"][0]["operator"] = json!("approximately");

    let response = app.send(admin_request("POST", &base, &rule)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_evaluate_uses_highest_priority_match() {
    let app = TestApp::spawn();
    app.add_user("alice", "alice@example.com");
    let (access, _) = app.login("alice").await;
    let base = format!("/applications/{}/rules", app.app.app_id);

    for rule in [editor_rule(10, "allow"), editor_rule(5, "deny")] {
        let response = app.send(admin_request("POST", &base, &rule)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .send(bearer_json_request(
            "POST",
            &format!("{}/evaluate", base),
            &access,
            &json!({ "attributes": { "role": "editor" } }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let decision = body_json(response).await;
    assert_eq!(decision["allowed"], true);
    assert_eq!(decision["matched_rule"]["priority"], 10);

    let response = app
        .send(bearer_json_request(
            "POST",
            &format!("{}/evaluate", base),
            &access,
            &json!({ "attributes": { "role": "viewer" } }),
        ))
        .await;
    let decision = body_json(response).await;
    assert_eq!(decision["allowed"], false);
    assert!(decision["matched_rule"].is_null());
}

#[tokio::test]
async fn test_evaluate_reports_missing_field_and_continues() {
    let app = TestApp::spawn();
    app.add_user("alice", "alice@example.com");
    let (access, _) = app.login("alice").await;
    let base = format!("/applications/{}/rules", app.app.app_id);

    let department_rule = json!({
        "rule_name": "sales-deny",
        "description": null,
        "priority": 50,
        "effect": "deny",
        "enabled": true,
        "conditions": [
            { "field": "user.dept", "operator": "eq", "value": "sales" }
        ]
    });
    app.send(admin_request("POST", &base, &department_rule)).await;
    app.send(admin_request("POST", &base, &editor_rule(10, "allow")))
        .await;

    let response = app
        .send(bearer_json_request(
            "POST",
            &format!("{}/evaluate", base),
            &access,
            &json!({ "attributes": { "role": "editor" } }),
        ))
        .await;
    let decision = body_json(response).await;
    assert_eq!(decision["allowed"], true);
    assert_eq!(decision["errors"][0]["kind"], "field_not_found");
}

#[tokio::test]
async fn test_evaluate_rejects_foreign_tenant() {
    let app = TestApp::spawn();
    app.add_user("alice", "alice@example.com");
    let (access, _) = app.login("alice").await;

    let response = app
        .send(bearer_json_request(
            "POST",
            &format!("/applications/{}/rules/evaluate", uuid::Uuid::new_v4()),
            &access,
            &json!({ "attributes": {} }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_evaluate_requires_bearer() {
    let app = TestApp::spawn();

    let response = app
        .send(json_request(
            "POST",
            &format!("/applications/{}/rules/evaluate", app.app.app_id),
            &json!({ "attributes": {} }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
