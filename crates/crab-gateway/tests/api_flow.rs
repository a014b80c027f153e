//! End-to-end client-protocol scenarios against the assembled router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};
use tower::ServiceExt;

use crab_core::config::{CrabConfig, CrabSection, StoreSection};
use crab_gateway::{build_router, AppState};
use crab_monitor::{MonitorConfig, StatusMap};
use crab_store::CrabStore;

fn config(base_url: Option<&str>) -> CrabConfig {
    CrabConfig {
        crab: CrabSection {
            base_url: base_url.map(String::from),
            ..CrabSection::default()
        },
        store: StoreSection {
            path: ":memory:".to_string(),
            retention_days: None,
        },
        outputstore: None,
        notify: Default::default(),
        transport: Default::default(),
        crabsh: Default::default(),
    }
}

fn router_with(base_url: Option<&str>) -> (Router, Arc<CrabStore>) {
    let store = Arc::new(CrabStore::new(Connection::open_in_memory().unwrap(), None).unwrap());
    let state = Arc::new(AppState {
        config: config(base_url),
        store: Arc::clone(&store),
        status: StatusMap::new(),
        defaults: MonitorConfig::default(),
        feed_enabled: base_url.is_some(),
        started_at: Utc::now(),
    });
    (build_router(state), store)
}

fn router() -> (Router, Arc<CrabStore>) {
    router_with(None)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

#[tokio::test]
async fn clean_run_ends_ok() {
    let (router, _store) = router();

    let (status, body) = send(
        &router,
        "PUT",
        "/api/0/crab/hostA/backup",
        Some(json!({"command": "/usr/bin/backup"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(
        &router,
        "PUT",
        "/api/0/crab/hostA/backup/start",
        Some(json!({"command": "/usr/bin/backup"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inhibit"], false);

    let (status, _) = send(
        &router,
        "PUT",
        "/api/0/crab/hostA/backup/finish",
        Some(json!({"command": "/usr/bin/backup", "status": 0, "stdout": "done\n"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, "GET", "/api/0/crab/hostA/backup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ok");
    assert_eq!(body["events"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn start_registers_implicitly_and_failing_finish_derives_fail() {
    let (router, store) = router();

    let (status, _) = send(
        &router,
        "PUT",
        "/api/0/crab/hostB/etl/start",
        Some(json!({"command": "/usr/bin/etl"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(store.get_jobs(false).unwrap().len(), 1);

    send(
        &router,
        "PUT",
        "/api/0/crab/hostB/etl/finish",
        Some(json!({"command": "/usr/bin/etl", "status": 2, "stderr": "boom"})),
    )
    .await;

    let (_, body) = send(&router, "GET", "/api/0/crab/hostB/etl", None).await;
    assert_eq!(body["state"], "fail");
}

#[tokio::test]
async fn reregistration_supersedes_old_command() {
    let (router, store) = router();

    send(
        &router,
        "PUT",
        "/api/0/crab/h/j",
        Some(json!({"command": "cmd1"})),
    )
    .await;
    send(
        &router,
        "PUT",
        "/api/0/crab/h/j",
        Some(json!({"command": "cmd2"})),
    )
    .await;

    let live = store.get_jobs(false).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].command, "cmd2");

    let (_, body) = send(&router, "GET", "/api/0/jobs", None).await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn inhibit_flag_round_trips_through_start() {
    let (router, store) = router();
    let id = store.ensure_job("h", Some("j"), "cmd").unwrap();

    let (status, body) = send(&router, "PUT", &format!("/api/0/job/{id}/inhibit"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inhibit"], true);

    let (_, body) = send(
        &router,
        "PUT",
        "/api/0/crab/h/j/start",
        Some(json!({"command": "cmd"})),
    )
    .await;
    assert_eq!(body["inhibit"], true);

    // The wrapper honours the flag by reporting an inhibited finish.
    let (status, _) = send(
        &router,
        "PUT",
        "/api/0/crab/h/j/finish",
        Some(json!({"command": "cmd", "kind": "inhibited"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = send(&router, "GET", "/api/0/crab/h/j", None).await;
    assert_eq!(body["state"], "warn");

    let (_, body) = send(&router, "DELETE", &format!("/api/0/job/{id}/inhibit"), None).await;
    assert_eq!(body["inhibit"], false);
}

#[tokio::test]
async fn missing_command_is_a_protocol_error() {
    let (router, store) = router();

    let (status, body) = send(&router, "PUT", "/api/0/crab/h/j/start", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("command"));
    // Protocol errors never become events or registrations.
    assert!(store.get_jobs(true).unwrap().is_empty());
}

#[tokio::test]
async fn unknown_finish_kind_is_rejected() {
    let (router, _store) = router();
    let (status, _) = send(
        &router,
        "PUT",
        "/api/0/crab/h/j/finish",
        Some(json!({"command": "cmd", "kind": "timeout"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn commandless_endpoints_key_on_command_text() {
    let (router, store) = router();

    send(
        &router,
        "PUT",
        "/api/0/crab/hostC/start",
        Some(json!({"command": "/usr/bin/rotate"})),
    )
    .await;
    send(
        &router,
        "PUT",
        "/api/0/crab/hostC/finish",
        Some(json!({"command": "/usr/bin/rotate", "status": 0})),
    )
    .await;
    assert_eq!(store.get_jobs(false).unwrap().len(), 1);

    let (status, body) = send(
        &router,
        "GET",
        "/api/0/crab/hostC?command=%2Fusr%2Fbin%2Frotate",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ok");
}

#[tokio::test]
async fn schedule_validation_rejects_bad_specs() {
    let (router, store) = router();
    let id = store.ensure_job("h", Some("j"), "cmd").unwrap();

    let (status, _) = send(
        &router,
        "PUT",
        &format!("/api/0/job/{id}/config"),
        Some(json!({"time": "every day"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        "PUT",
        &format!("/api/0/job/{id}/config"),
        Some(json!({"time": "*/5 * * * *", "timezone": "Europe/Berlin", "graceperiod": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let config = store.get_config(id).unwrap().unwrap();
    assert_eq!(config.time.as_deref(), Some("*/5 * * * *"));
    assert_eq!(config.graceperiod, Some(60));
}

#[tokio::test]
async fn notification_rules_replace_via_api() {
    let (router, _store) = router();

    let rules = json!([{
        "id": 1,
        "host": null,
        "crabid": null,
        "min_severity": "missed",
        "method": "email",
        "address": ["ops@example.com"],
        "skip_ok": true,
        "include_output": false,
        "cooldown": null
    }]);
    let (status, _) = send(&router, "PUT", "/api/0/notify", Some(rules)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&router, "GET", "/api/0/notify", None).await;
    let fetched = body["notifications"].as_array().unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0]["min_severity"], "missed");

    // A rule without addresses is refused.
    let bad = json!([{
        "id": 0, "host": null, "crabid": null, "min_severity": "ok",
        "method": "email", "address": [], "skip_ok": true,
        "include_output": false, "cooldown": null
    }]);
    let (status, _) = send(&router, "PUT", "/api/0/notify", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn output_endpoint_serves_reassembled_blobs() {
    let (router, store) = router();
    let id = store.ensure_job("h", Some("j"), "cmd").unwrap();
    let event = store
        .log_finish(
            id,
            crab_core::EventKind::Finish,
            Utc::now(),
            Some(0),
            Some(&crab_core::JobOutput {
                stdout: Some("hello".to_string()),
                stderr: None,
            }),
        )
        .unwrap();

    let (status, body) = send(
        &router,
        "GET",
        &format!("/api/0/job/{id}/output/{event}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stdout"], "hello");

    // An event id belonging to another job is not served.
    let other = store.ensure_job("h", Some("k"), "cmd2").unwrap();
    let (status, _) = send(
        &router,
        "GET",
        &format!("/api/0/job/{other}/output/{event}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn feed_is_a_startup_feature_flag() {
    let (router, _store) = router_with(None);
    let (status, _) = send(&router, "GET", "/feed", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (router, store) = router_with(Some("http://crab.example.com/"));
    let id = store.ensure_job("h", Some("j"), "cmd").unwrap();
    store
        .log_finish(id, crab_core::EventKind::Finish, Utc::now(), Some(0), None)
        .unwrap();

    let (status, body) = send(&router, "GET", "/feed", None).await;
    assert_eq!(status, StatusCode::OK);
    let xml = body.as_str().unwrap();
    assert!(xml.contains("<rss version=\"2.0\">"));
    assert!(xml.contains("j on h: finish status=0"));
    assert!(xml.contains("http://crab.example.com/api/0/job/"));
}
