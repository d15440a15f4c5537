mod common;

use common::spawn_app;
use flagrelay::auth::hash_secret;
use flagrelay::config::{AgentConfig, OAuthClientConfig};
use serde_json::{json, Value};

const SDK_HEADER: &str = "X-Optimizely-SDK-Key";

fn with_api_auth(cfg: &mut AgentConfig) {
    cfg.api.auth.hmac_secrets = vec!["signing-secret".to_string()];
    cfg.api.auth.clients = vec![OAuthClientConfig {
        id: "optly_user".to_string(),
        secret_hash: hash_secret("client_seekrit"),
    }];
}

fn with_admin_auth(cfg: &mut AgentConfig) {
    cfg.admin.auth.hmac_secrets = vec!["admin-signing-secret".to_string()];
    cfg.admin.auth.clients = vec![OAuthClientConfig {
        id: "admin_user".to_string(),
        secret_hash: hash_secret("admin_seekrit"),
    }];
}

#[tokio::test]
async fn token_endpoint_rejects_json_bodies() {
    let app = spawn_app(with_api_auth).await;
    let resp = app
        .http
        .post(app.api_url("/oauth/token"))
        .header(SDK_HEADER, "key1")
        .json(&json!({"grant_type": "client_credentials"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn token_endpoint_validates_the_grant() {
    let app = spawn_app(with_api_auth).await;

    let resp = app
        .http
        .post(app.api_url("/oauth/token"))
        .header(SDK_HEADER, "key1")
        .form(&[("client_id", "optly_user"), ("client_secret", "client_seekrit")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");

    let resp = app
        .http
        .post(app.api_url("/oauth/token"))
        .header(SDK_HEADER, "key1")
        .form(&[
            ("grant_type", "password"),
            ("client_id", "optly_user"),
            ("client_secret", "client_seekrit"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unsupported_grant_type");

    let resp = app
        .http
        .post(app.api_url("/oauth/token"))
        .header(SDK_HEADER, "key1")
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "optly_user"),
            ("client_secret", "wrong"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_client");
}

#[tokio::test]
async fn api_token_requires_the_sdk_key_header() {
    let app = spawn_app(with_api_auth).await;
    let resp = app
        .http
        .post(app.api_url("/oauth/token"))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "optly_user"),
            ("client_secret", "client_seekrit"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error_description"]
        .as_str()
        .unwrap()
        .contains("X-Optimizely-SDK-Key"));
}

async fn fetch_api_token(app: &common::TestApp, sdk_key: &str) -> String {
    let body: Value = app
        .http
        .post(app.api_url("/oauth/token"))
        .header(SDK_HEADER, sdk_key)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "optly_user"),
            ("client_secret", "client_seekrit"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["token_type"], "bearer");
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn api_tokens_are_scoped_to_their_sdk_key() {
    let app = spawn_app(with_api_auth).await;
    let decide = json!({"userId": "u1"});

    // Protected without a token.
    let resp = app
        .http
        .post(app.api_url("/v1/decide?keys=flag1"))
        .header(SDK_HEADER, "key1")
        .json(&decide)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // A token for another key does not cover this request.
    let other = fetch_api_token(&app, "otherkey").await;
    let resp = app
        .http
        .post(app.api_url("/v1/decide?keys=flag1"))
        .header(SDK_HEADER, "key1")
        .bearer_auth(&other)
        .json(&decide)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let token = fetch_api_token(&app, "key1").await;
    let resp = app
        .http
        .post(app.api_url("/v1/decide?keys=flag1"))
        .header(SDK_HEADER, "key1")
        .bearer_auth(&token)
        .json(&decide)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn unconfigured_auth_leaves_the_api_open() {
    let app = spawn_app(|_| {}).await;
    let resp = app
        .http
        .post(app.api_url("/v1/decide?keys=flag1"))
        .header(SDK_HEADER, "key1")
        .json(&json!({"userId": "u1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn admin_endpoints_require_an_admin_token() {
    let app = spawn_app(with_admin_auth).await;

    let resp = app.http.get(app.admin_url("/info")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    // Health stays open.
    let resp = app.http.get(app.admin_url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let token: Value = app
        .http
        .post(app.admin_url("/oauth/token"))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", "admin_user"),
            ("client_secret", "admin_seekrit"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = token["access_token"].as_str().unwrap();

    let resp = app
        .http
        .get(app.admin_url("/info"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let info: Value = resp.json().await.unwrap();
    assert_eq!(info["name"], "flagrelay");

    let resp = app
        .http
        .get(app.admin_url("/config"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cfg: Value = resp.json().await.unwrap();
    // The echoed config never carries secrets.
    assert_eq!(cfg["admin"]["auth"]["hmacSecrets"], json!([""]));

    let resp = app
        .http
        .get(app.admin_url("/metrics"))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn admin_responses_are_stamped() {
    let app = spawn_app(|_| {}).await;
    let resp = app.http.get(app.admin_url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("app-name").unwrap().to_str().unwrap(),
        "flagrelay"
    );
    assert!(resp.headers().contains_key("app-version"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
