mod common;

use common::{sample_datafile, spawn_app};
use flagrelay::config::WebhookProject;
use flagrelay::webhook::compute_signature;
use serde_json::{json, Value};

const SDK_HEADER: &str = "X-Optimizely-SDK-Key";
const SIGNATURE_HEADER: &str = "X-Hub-Signature";

// Body bytes and signature as produced by the upstream application.
const SIGNED_BODY: &str = r#"{"project_id":42,"timestamp":42424242,"event":"project.datafile_updated","data":{"revision":101,"origin_url":"origin.optimizely.com/datafiles/myDatafile","cdn_url":"cdn.optimizely.com/datafiles/myDatafile","environment":"Production"}}"#;
const SIGNATURE: &str = "sha1=e0199de63fb7192634f52136d4ceb7dc6f191da3";

fn with_project(cfg: &mut flagrelay::config::AgentConfig) {
    cfg.webhook.projects.insert(
        42,
        WebhookProject {
            sdk_keys: vec!["myDatafile".to_string()],
            secret: "I am secret".to_string(),
            skip_signature_check: false,
        },
    );
}

#[tokio::test]
async fn signed_webhook_refreshes_the_datafile() {
    let app = spawn_app(with_project).await;
    app.cdn.set("myDatafile", &sample_datafile());

    // Build the handle first so the refresh has something to act on.
    let config: Value = app
        .http
        .get(app.api_url("/v1/config"))
        .header(SDK_HEADER, "myDatafile")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["revision"], "1");

    let mut updated: Value = serde_json::from_str(&sample_datafile()).unwrap();
    updated["revision"] = json!("101");
    app.cdn.set("myDatafile", &updated.to_string());

    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .header(SIGNATURE_HEADER, SIGNATURE)
        .body(SIGNED_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let config: Value = app
        .http
        .get(app.api_url("/v1/config"))
        .header(SDK_HEADER, "myDatafile")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["revision"], "101");
}

#[tokio::test]
async fn bad_or_missing_signature_is_rejected_before_any_update() {
    let app = spawn_app(with_project).await;

    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .header(SIGNATURE_HEADER, "sha1=deadbeef")
        .body(SIGNED_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "computed signature does not match signature in request"
    );

    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .body(SIGNED_BODY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn unknown_project_is_acknowledged() {
    let app = spawn_app(with_project).await;
    let body = json!({"project_id": 999, "timestamp": 1, "event": "project.datafile_updated"});
    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn unparseable_body_is_a_bad_request() {
    let app = spawn_app(with_project).await;
    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn signature_check_can_be_skipped() {
    let app = spawn_app(|cfg| {
        cfg.webhook.projects.insert(
            42,
            WebhookProject {
                sdk_keys: vec!["myDatafile".to_string()],
                secret: String::new(),
                skip_signature_check: true,
            },
        );
    })
    .await;
    let body = json!({"project_id": 42, "timestamp": 1, "event": "project.datafile_updated"});
    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn signatures_from_the_helper_are_accepted() {
    let app = spawn_app(with_project).await;
    let body = json!({"project_id": 42, "timestamp": 7, "event": "project.datafile_updated"}).to_string();
    let resp = app
        .http
        .post(app.webhook_url("/webhooks/optimizely"))
        .header(SIGNATURE_HEADER, compute_signature("I am secret", body.as_bytes()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}
