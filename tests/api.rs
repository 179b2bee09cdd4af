//! Job API driven over HTTP, with steps delivered from the recording queue.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use shipwright::pipeline::StepDispatcher;
use shipwright::server::api::AppState;
use shipwright::server::build_router;
use shipwright::testing::{ScriptedResponse, TestHarness};

fn app(h: &TestHarness) -> Router {
    build_router(Arc::new(AppState {
        transitions: h.transitions.clone(),
        secrets: h.secrets.clone(),
        artifacts: h.artifacts.clone(),
    }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn pump(h: &TestHarness, dispatcher: &StepDispatcher) {
    loop {
        let batch = h.queue.drain();
        if batch.is_empty() {
            return;
        }
        for message in batch {
            dispatcher.dispatch(&message).await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_full_job_lifecycle_over_http() {
    let h = TestHarness::new();
    let dispatcher = h.dispatcher();
    let app = app(&h);
    for doc in ["# Spec", "# Plan", "# Tests"] {
        h.provider.push(ScriptedResponse::text(doc));
        h.provider.push(ScriptedResponse::text("Aligned."));
    }
    h.provider.push(ScriptedResponse::files(&[
        ("src/login.ts", "export function login() {}"),
        ("tests/login.test.ts", "test('login', () => {});"),
    ]));
    h.provider.push(ScriptedResponse::text("VERDICT: PASS"));
    h.provider.push(ScriptedResponse::text("VERDICT: PASS"));

    let (status, job) = send_json(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"owner_id": TestHarness::OWNER, "title": "Login", "brief": "Email login"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "drafting");
    let id = job["id"].as_str().unwrap().to_string();

    let (status, job) = send_json(&app, "POST", &format!("/api/jobs/{id}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "spec_generating");
    pump(&h, &dispatcher).await;

    for expected in ["plan_ready", "tests_ready", "done"] {
        let (status, _) = send_json(&app, "POST", &format!("/api/jobs/{id}/approve"), None).await;
        assert_eq!(status, StatusCode::OK);
        pump(&h, &dispatcher).await;
        let (_, job) = send_json(&app, "GET", &format!("/api/jobs/{id}"), None).await;
        assert_eq!(job["status"], expected);
    }

    let (_, job) = send_json(&app, "GET", &format!("/api/jobs/{id}"), None).await;
    assert_eq!(job["spec_md"], "# Spec");
    assert_eq!(job["security_review_md"], "VERDICT: PASS");

    let (status, list) = send_json(&app, "GET", &format!("/api/jobs/{id}/files"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["files"], json!(["src/login.ts", "tests/login.test.ts"]));

    let (status, bytes) = send(&app, "GET", &format!("/api/jobs/{id}/files/tests/login.test.ts"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"test('login', () => {});");
}

#[tokio::test]
async fn test_secret_stored_over_http_is_used_by_steps() {
    let h = TestHarness::new();
    let dispatcher = h.dispatcher();
    let app = app(&h);
    h.provider.push(ScriptedResponse::text("# Spec"));
    h.provider.push(ScriptedResponse::text("ok"));

    let (status, _) = send_json(
        &app,
        "PUT",
        "/api/owners/o2/secrets/anthropic_api_key",
        Some(json!({"value": "sk-owner-two"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, job) = send_json(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"owner_id": "o2", "title": "Search"})),
    )
    .await;
    let id = job["id"].as_str().unwrap().to_string();
    send_json(&app, "POST", &format!("/api/jobs/{id}/start"), None).await;
    pump(&h, &dispatcher).await;

    let (_, job) = send_json(&app, "GET", &format!("/api/jobs/{id}"), None).await;
    assert_eq!(job["status"], "spec_ready");
    assert!(h.provider.requests().iter().all(|r| r.api_key == "sk-owner-two"));
}

#[tokio::test]
async fn test_missing_credential_fails_job_and_retry_returns_to_drafting() {
    let h = TestHarness::new();
    let dispatcher = h.dispatcher();
    let app = app(&h);

    let (_, job) = send_json(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"owner_id": "nobody", "title": "Export"})),
    )
    .await;
    let id = job["id"].as_str().unwrap().to_string();
    send_json(&app, "POST", &format!("/api/jobs/{id}/start"), None).await;
    pump(&h, &dispatcher).await;

    let (_, job) = send_json(&app, "GET", &format!("/api/jobs/{id}"), None).await;
    assert_eq!(job["status"], "failed");
    assert!(job["error_message"].as_str().unwrap().contains("API key"));
    assert_eq!(h.provider.calls(), 0);

    let (status, job) = send_json(&app, "POST", &format!("/api/jobs/{id}/retry"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "drafting");

    let (status, body) = send_json(&app, "POST", &format!("/api/jobs/{id}/retry"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("only failed jobs"));
}

#[tokio::test]
async fn test_revise_from_plan_gate_over_http() {
    let h = TestHarness::new();
    let dispatcher = h.dispatcher();
    let app = app(&h);
    for doc in ["# Spec", "# Plan", "# Spec again"] {
        h.provider.push(ScriptedResponse::text(doc));
        h.provider.push(ScriptedResponse::text("ok"));
    }

    let (_, job) = send_json(
        &app,
        "POST",
        "/api/jobs",
        Some(json!({"owner_id": TestHarness::OWNER, "title": "Export", "brief": "CSV"})),
    )
    .await;
    let id = job["id"].as_str().unwrap().to_string();
    send_json(&app, "POST", &format!("/api/jobs/{id}/start"), None).await;
    pump(&h, &dispatcher).await;
    send_json(&app, "POST", &format!("/api/jobs/{id}/approve"), None).await;
    pump(&h, &dispatcher).await;

    let (status, job) = send_json(&app, "POST", &format!("/api/jobs/{id}/revise"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "spec_generating");
    assert_eq!(job["plan_md"], Value::Null);
    pump(&h, &dispatcher).await;

    let (_, job) = send_json(&app, "GET", &format!("/api/jobs/{id}"), None).await;
    assert_eq!(job["status"], "spec_ready");
    assert_eq!(job["spec_md"], "# Spec again");
}
