use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::Value;
use tower::ServiceExt;

use shadow_scan::evaluator::SimulatedEvaluator;
use shadow_scan::scheduler::BatchScheduler;
use shadow_scan::server::{router, AppState};
use shadow_scan::session::ScanEngine;

fn engine() -> ScanEngine {
    ScanEngine::new(
        Arc::new(SimulatedEvaluator::seeded(5)),
        BatchScheduler::new(50, Duration::ZERO),
    )
}

fn app(engine: ScanEngine, token: Option<&str>) -> Router {
    router(AppState::new(engine, token.map(str::to_string)))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn post_scan(body: &str) -> Request<Body> {
    Request::post("/api/scan")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn status_starts_idle() {
    let app = app(engine(), None);
    let (code, json) = call(&app, get("/api/status")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(json["state"], "idle");
    assert_eq!(json["found"], 0);
}

#[tokio::test]
async fn scan_runs_to_completion_and_serves_results() {
    let engine = engine();
    let app = app(engine.clone(), None);

    let (code, json) = call(&app, post_scan(r#"{"target":"10.0.0.5","portRange":"1-200"}"#)).await;
    assert_eq!(code, StatusCode::ACCEPTED);
    assert_eq!(json["target"], "10.0.0.5");
    assert_eq!(json["total"], 200);

    engine.wait().await.expect("scan ran");

    let (_, status) = call(&app, get("/api/status")).await;
    assert_eq!(status["state"], "completed");
    assert_eq!(status["progress"], 100.0);
    assert_eq!(
        status["found"].as_u64(),
        Some(status["open"].as_u64().unwrap() + status["filtered"].as_u64().unwrap())
    );

    let (code, results) = call(&app, get("/api/results")).await;
    assert_eq!(code, StatusCode::OK);
    let results = results.as_array().unwrap();
    assert_eq!(results.len() as u64, status["found"].as_u64().unwrap());
    assert!(results.iter().all(|r| r["status"] != "closed"));

    let (_, log) = call(&app, get("/api/log")).await;
    let log = log.as_array().unwrap();
    assert_eq!(log.first().unwrap()["kind"], "info");
    assert_eq!(log.last().unwrap()["kind"], "complete");
    assert_eq!(log.len(), results.len() + 2);
}

#[tokio::test]
async fn malformed_range_is_bad_request() {
    let engine = engine();
    let app = app(engine.clone(), None);

    let (code, json) = call(&app, post_scan(r#"{"target":"10.0.0.5","port_range":"abc"}"#)).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("invalid scan request"));

    let (code, _) = call(&app, post_scan(r#"{"target":"  ","port_range":"1-10"}"#)).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);

    assert!(engine.snapshot().await.results.is_empty());
    assert_eq!(engine.wait().await, None);
}

#[tokio::test]
async fn second_scan_conflicts_and_cancel_stops_it() {
    let engine = ScanEngine::new(
        Arc::new(SimulatedEvaluator::seeded(5)),
        BatchScheduler::new(1, Duration::from_secs(3600)),
    );
    let app = app(engine, None);

    let (code, _) = call(&app, post_scan(r#"{"target":"h","port_range":"1-100"}"#)).await;
    assert_eq!(code, StatusCode::ACCEPTED);

    let (code, json) = call(&app, post_scan(r#"{"target":"h","port_range":"1-100"}"#)).await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(json["error"], "a scan is already running");

    let cancel = Request::post("/api/cancel").body(Body::empty()).unwrap();
    let (code, json) = call(&app, cancel).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(json["outcome"], "cancelled");

    let (_, status) = call(&app, get("/api/status")).await;
    assert_eq!(status["state"], "idle");

    let cancel = Request::post("/api/cancel").body(Body::empty()).unwrap();
    let (code, _) = call(&app, cancel).await;
    assert_eq!(code, StatusCode::CONFLICT);
}

#[tokio::test]
async fn token_gate_blocks_unauthenticated_calls() {
    let app = app(engine(), Some("letmein"));

    let (code, json) = call(&app, get("/api/status")).await;
    assert_eq!(code, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "authentication required");

    let req = Request::get("/api/status")
        .header(header::AUTHORIZATION, "Bearer letmein")
        .body(Body::empty())
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
}

#[tokio::test]
async fn preset_selects_the_port_list() {
    let engine = engine();
    let app = app(engine.clone(), None);

    let (code, json) = call(&app, post_scan(r#"{"target":"h","preset":"web"}"#)).await;
    assert_eq!(code, StatusCode::ACCEPTED);
    assert_eq!(json["port_range"], "80,443,22,21,3306");
    assert_eq!(json["total"], 5);

    engine.wait().await.expect("scan ran");
    let (code, _) = call(&app, post_scan(r#"{"target":"h","preset":"huge"}"#)).await;
    assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
}

/// JSON payloads of the `data:` lines in an SSE chunk; keep-alive comments are skipped.
fn sse_payloads(chunk: &str) -> Vec<Value> {
    chunk
        .split("\n\n")
        .flat_map(|frame| frame.lines())
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}

#[tokio::test]
async fn event_stream_carries_a_whole_scan() {
    let engine = engine();
    let app = app(engine.clone(), None);

    let res = app.clone().oneshot(get("/api/events")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/event-stream");
    let mut body = res.into_body().into_data_stream();

    let (code, _) = call(&app, post_scan(r#"{"target":"10.0.0.5","port_range":"1-200"}"#)).await;
    assert_eq!(code, StatusCode::ACCEPTED);

    let mut events: Vec<Value> = Vec::new();
    while events.last().map_or(true, |e| e["type"] != "completed") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("event within five seconds")
            .expect("stream still open")
            .unwrap();
        events.extend(sse_payloads(std::str::from_utf8(&chunk).unwrap()));
    }

    assert_eq!(events[0]["type"], "started");
    assert_eq!(events[0]["total"], 200);
    assert_eq!(events[1]["type"], "log");
    assert!(events[1]["message"].as_str().unwrap().contains("10.0.0.5"));

    let percents: Vec<f64> = events
        .iter()
        .filter(|e| e["type"] == "progress")
        .map(|e| e["percent"].as_f64().unwrap())
        .collect();
    assert_eq!(percents, vec![25.0, 50.0, 75.0, 100.0]);

    let last = events.last().unwrap();
    assert_eq!(last["processed"], 200);
    let open = events
        .iter()
        .filter(|e| e["type"] == "result" && e["status"] == "open")
        .count();
    assert_eq!(last["open"].as_u64(), Some(open as u64));
}
