use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    error::ScanError,
    journal::{LogKind, LogLine},
    ports::PortPreset,
    session::ScanEngine,
    types::{ScanRequest, ScanSession, SessionState},
};

#[derive(Clone)]
pub struct AppState {
    engine: ScanEngine,
    api_token: Option<Arc<str>>, // capability gate in front of the engine
}

impl AppState {
    pub fn new(engine: ScanEngine, api_token: Option<String>) -> Self {
        Self {
            engine,
            api_token: api_token.map(Arc::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Status {
    pub state: SessionState,
    pub target: Option<String>,
    pub port_range: Option<String>,
    pub progress: f64,
    pub processed: u64,
    pub total: u64,
    pub found: usize,
    pub open: usize,
    pub filtered: usize,
}

impl From<&ScanSession> for Status {
    fn from(s: &ScanSession) -> Self {
        Self {
            state: s.state,
            target: s.request.as_ref().map(|r| r.target().to_string()),
            port_range: s.request.as_ref().map(|r| r.port_range().to_string()),
            progress: s.progress,
            processed: s.processed,
            total: s.total,
            found: s.results.len(),
            open: s.open_count(),
            filtered: s.filtered_count(),
        }
    }
}

/// An explicit `port_range` wins over `preset`; with neither, `1-1000` is scanned.
#[derive(Debug, Deserialize)]
pub struct ScanRequestBody {
    pub target: String,
    #[serde(alias = "portRange", default)]
    pub port_range: Option<String>,
    #[serde(default)]
    pub preset: Option<PortPreset>,
}

impl ScanRequestBody {
    fn port_range(&self) -> &str {
        match (&self.port_range, self.preset) {
            (Some(range), _) => range,
            (None, Some(preset)) => preset.port_range(),
            (None, None) => DEFAULT_PORT_RANGE,
        }
    }
}

const DEFAULT_PORT_RANGE: &str = "1-1000";

/// Log line as served to clients, with its derived presentation kind.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub time: String,
    pub message: String,
    pub kind: LogKind,
}

impl From<&LogLine> for LogEntry {
    fn from(line: &LogLine) -> Self {
        Self {
            at: line.at,
            time: line.clock_time(),
            message: line.message.clone(),
            kind: line.kind(),
        }
    }
}

/// `ScanError` mapped onto HTTP status codes.
pub struct ApiError(ScanError);

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match self.0 {
            ScanError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ScanError::ConcurrentScanConflict | ScanError::NotRunning => StatusCode::CONFLICT,
        };
        error_body(code, self.0.to_string())
    }
}

fn error_body(code: StatusCode, message: String) -> Response {
    (code, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Build the API router. Everything lives under `/api`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/cancel", post(post_cancel))
        .route("/results", get(get_results))
        .route("/log", get(get_log))
        .route("/events", get(get_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving scan API");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn require_token(State(app): State<AppState>, req: Request, next: Next) -> Response {
    match app.api_token.as_deref() {
        Some(token) if !bearer_matches(req.headers(), token) => {
            error_body(StatusCode::UNAUTHORIZED, "authentication required".into())
        }
        _ => next.run(req).await,
    }
}

fn bearer_matches(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented.trim() == token)
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.engine.snapshot().await;
    (StatusCode::OK, Json(Status::from(&s)))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.engine.results().await))
}

async fn get_log(State(app): State<AppState>) -> impl IntoResponse {
    let entries: Vec<LogEntry> = app.engine.log().await.iter().map(LogEntry::from).collect();
    (StatusCode::OK, Json(entries))
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request = ScanRequest::new(&req.target, req.port_range())?;
    app.engine.start(request).await?;
    let s = app.engine.snapshot().await;
    Ok((StatusCode::ACCEPTED, Json(Status::from(&s))))
}

async fn post_cancel(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let outcome = app.engine.cancel().await?;
    Ok((StatusCode::OK, Json(outcome)))
}

async fn get_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app.engine.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), rx)),
                    Err(e) => warn!(error = %e, "dropping unserializable scan event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_must_match_exactly() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, "abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(bearer_matches(&headers, "abc"));
        assert!(!bearer_matches(&headers, "abcd"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(!bearer_matches(&headers, "abc"));
    }

    #[test]
    fn request_body_prefers_explicit_range_over_preset() {
        let body: ScanRequestBody =
            serde_json::from_str(r#"{"target":"h","preset":"web"}"#).unwrap();
        assert_eq!(body.port_range(), "80,443,22,21,3306");

        let body: ScanRequestBody =
            serde_json::from_str(r#"{"target":"h","portRange":"7","preset":"all"}"#).unwrap();
        assert_eq!(body.port_range(), "7");

        let body: ScanRequestBody = serde_json::from_str(r#"{"target":"h"}"#).unwrap();
        assert_eq!(body.port_range(), "1-1000");
    }
}
