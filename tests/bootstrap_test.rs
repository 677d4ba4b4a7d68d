mod common;

use common::{doc_str, TestApp};
use mongodb::bson::doc;
use morrigan::store::DocumentStore;
use serde_json::Value;

#[tokio::test]
async fn boot_creates_exactly_one_admin_identity() {
    let app = TestApp::spawn().await;

    let identities = app
        .store
        .find("identities", doc! {})
        .await
        .expect("identities read");
    assert_eq!(identities.len(), 1);
    assert_eq!(doc_str(&identities[0], "name"), "admin");
    let functions = identities[0].get_array("functions").expect("functions");
    assert!(!functions.is_empty(), "admin has a non-empty function list");

    app.server.stop("test over").await.unwrap();
}

#[tokio::test]
async fn admin_login_returns_a_token_bound_to_the_admin_identity() {
    let app = TestApp::spawn().await;

    let token = app.admin_token().await;

    let response = app
        .http
        .get(app.url("/api/auth/identity/me"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let me: Value = response.json().await.unwrap();
    assert_eq!(me["name"], "admin");

    let admin_row = app
        .store
        .find_one("identities", doc! { "name": "admin" })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(me["id"].as_str().unwrap(), doc_str(&admin_row, "_id"));

    app.server.stop("test over").await.unwrap();
}

#[tokio::test]
async fn login_with_wrong_password_is_403_failed() {
    let app = TestApp::spawn().await;

    let response = app
        .http
        .post(app.url("/api/auth"))
        .json(&serde_json::json!({ "name": "admin", "password": "not-the-password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "failed");

    app.server.stop("test over").await.unwrap();
}

#[tokio::test]
async fn login_without_a_name_is_400() {
    let app = TestApp::spawn().await;

    let response = app
        .http
        .post(app.url("/api/auth"))
        .json(&serde_json::json!({ "password": "whatever-long" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["state"], "requestError");

    app.server.stop("test over").await.unwrap();
}

#[tokio::test]
async fn api_docs_is_served_and_covers_installed_routes() {
    let app = TestApp::spawn().await;

    let response = app.http.get(app.url("/api-docs")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let doc: Value = response.json().await.unwrap();

    assert_eq!(doc["openapi"], "3.0.3");
    assert!(doc["paths"]["/api/auth"].get("post").is_some());
    assert!(doc["paths"]["/api/client/provision"].get("post").is_some());
    assert!(doc["paths"]["/api/connection/connect"].get("get").is_some());

    app.server.stop("test over").await.unwrap();
}
