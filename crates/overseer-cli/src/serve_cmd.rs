//! `overseer serve`: the Control API and live event stream.
//!
//! Control commands answer `{success, error?}` with status 200 so clients
//! only have to look at `success`; query failures go through [`AppError`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use overseer_core::broadcast::Broadcaster;
use overseer_core::hours::AllowedHours;
use overseer_core::supervisor::{
    StartOptions, StatusSnapshot, StopOutcome, Supervisor, SupervisorError,
};
use overseer_db::models::{HistoryFilter, HistoryPage, HistoryStats, IterationResult};
use overseer_db::store::DEFAULT_PAGE_SIZE;

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    /// Cancelled on shutdown so open event streams end.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            shutdown: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub performer: Option<String>,
    pub max_iterations: Option<u32>,
    pub start_hour: Option<u8>,
    pub end_hour: Option<u8>,
}

impl StartRequest {
    /// A missing bound takes the whole-day default for that side.
    pub fn into_options(self) -> StartOptions {
        let allowed_hours = match (self.start_hour, self.end_hour) {
            (None, None) => None,
            (start, end) => Some(AllowedHours {
                start: start.unwrap_or(AllowedHours::ALL_DAY.start),
                end: end.unwrap_or(AllowedHours::ALL_DAY.end),
            }),
        };
        StartOptions {
            performer: self.performer.filter(|p| !p.is_empty()),
            max_iterations: self.max_iterations,
            allowed_hours,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
    pub error: Option<String>,
}

impl ControlResponse {
    fn ok() -> Self {
        Self {
            success: true,
            pid: None,
            outcome: None,
            error: None,
        }
    }

    fn failed(command: &str, err: &SupervisorError) -> Self {
        warn!(command, error = %err, "control command failed");
        Self {
            success: false,
            pid: None,
            outcome: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub result: Option<IterationResult>,
    pub performer: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn outcome_name(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::NotRunning => "not_running",
        StopOutcome::Graceful => "graceful",
        StopOutcome::Killed => "killed",
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/start", post(start_agent))
        .route("/api/stop", post(stop_agent))
        .route("/api/pause", post(pause_agent))
        .route("/api/resume", post(resume_agent))
        .route("/api/history", get(list_history))
        .route("/api/history/stats", get(history_stats))
        .route("/api/history/performers", get(history_performers))
        .route("/api/history/{id}", get(get_history_record))
        .route("/api/events", get(live_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(supervisor: Supervisor, bind: &str, port: u16) -> Result<()> {
    let state = AppState::new(supervisor.clone());
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {bind}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("overseer serve listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    match supervisor.stop(false).await {
        Ok(StopOutcome::NotRunning) => {}
        Ok(outcome) => info!(outcome = outcome_name(outcome), "agent stopped on shutdown"),
        Err(e) => warn!(error = %e, "failed to stop agent on shutdown"),
    }
    supervisor.history().close().await;
    info!("overseer serve shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Control handlers
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.supervisor.status().await)
}

async fn start_agent(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Json<ControlResponse> {
    match state.supervisor.start(request.into_options()).await {
        Ok(pid) => Json(ControlResponse {
            pid: Some(pid),
            ..ControlResponse::ok()
        }),
        Err(e) => Json(ControlResponse::failed("start", &e)),
    }
}

async fn stop_agent(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> Json<ControlResponse> {
    match state.supervisor.stop(request.force).await {
        Ok(outcome) => Json(ControlResponse {
            outcome: Some(outcome_name(outcome)),
            ..ControlResponse::ok()
        }),
        Err(e) => Json(ControlResponse::failed("stop", &e)),
    }
}

async fn pause_agent(State(state): State<AppState>) -> Json<ControlResponse> {
    match state.supervisor.pause().await {
        Ok(()) => Json(ControlResponse::ok()),
        Err(e) => Json(ControlResponse::failed("pause", &e)),
    }
}

async fn resume_agent(State(state): State<AppState>) -> Json<ControlResponse> {
    match state.supervisor.resume().await {
        Ok(()) => Json(ControlResponse::ok()),
        Err(e) => Json(ControlResponse::failed("resume", &e)),
    }
}

// ---------------------------------------------------------------------------
// History handlers
// ---------------------------------------------------------------------------

async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryPage>, AppError> {
    let filter = HistoryFilter {
        result: params.result,
        performer: params.performer.filter(|p| !p.is_empty()),
    };
    let page = state
        .supervisor
        .history()
        .query(
            &filter,
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            params.offset.unwrap_or(0),
        )
        .await
        .map_err(AppError::internal)?;
    Ok(Json(page))
}

async fn history_stats(State(state): State<AppState>) -> Result<Json<HistoryStats>, AppError> {
    let stats = state
        .supervisor
        .history()
        .stats()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(stats))
}

async fn history_performers(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, AppError> {
    let performers = state
        .supervisor
        .history()
        .distinct_performers()
        .await
        .map_err(AppError::internal)?;
    Ok(Json(performers))
}

async fn get_history_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    let record = state
        .supervisor
        .history()
        .get(id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("iteration record {id} not found")))?;
    Ok(Json(record).into_response())
}

// ---------------------------------------------------------------------------
// Live events
// ---------------------------------------------------------------------------

/// Unregisters an SSE connection's subscriber when its stream is dropped.
struct SubscriberGuard {
    broadcaster: Broadcaster,
    id: Uuid,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let broadcaster = self.broadcaster.clone();
        let id = self.id;
        runtime.spawn(async move {
            if broadcaster.unregister(id).await {
                debug!(subscriber = %id, "live event stream closed");
            }
        });
    }
}

async fn live_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let broadcaster = state.supervisor.broadcaster().clone();
    let mut subscription = broadcaster.register().await;
    let guard = SubscriberGuard {
        broadcaster,
        id: subscription.id,
    };
    let shutdown = state.shutdown.clone();
    debug!(subscriber = %subscription.id, "live event stream opened");

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = subscription.recv() => event,
            };
            let Some(event) = event else { break };
            match Event::default().event(event.name()).json_data(&event) {
                Ok(frame) => yield Ok(frame),
                Err(e) => warn!(event = event.name(), error = %e, "failed to encode live event"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text("ping"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;
    use tower::ServiceExt;

    use overseer_core::backlog::FixedBacklog;
    use overseer_core::broadcast::{Broadcaster, LiveEvent};
    use overseer_core::supervisor::{Supervisor, SupervisorConfig};
    use overseer_db::models::{IterationResult, NewIterationRecord};
    use overseer_test_utils::{TestDb, create_test_db};

    use super::AppState;

    const WAIT: Duration = Duration::from_secs(10);

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn app_state(db: &TestDb, agent: &str) -> AppState {
        let config = SupervisorConfig {
            agent_args: Vec::new(),
            working_dir: Some(db.dir().to_path_buf()),
            grace_period: Duration::from_secs(2),
            exit_drain_timeout: Duration::from_secs(1),
            ..SupervisorConfig::new(agent)
        };
        let supervisor = Supervisor::new(
            config,
            db.store(),
            Arc::new(FixedBacklog::new(0)),
            Broadcaster::new(),
        );
        AppState::new(supervisor)
    }

    async fn get(state: &AppState, uri: &str) -> axum::response::Response {
        let app = super::build_router(state.clone());
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post(
        state: &AppState,
        uri: &str,
        body: serde_json::Value,
    ) -> axum::response::Response {
        let app = super::build_router(state.clone());
        app.oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn record(n: i64, performer: &str, result: IterationResult) -> NewIterationRecord {
        let started_at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        NewIterationRecord {
            iteration_number: n,
            performer_name: performer.to_string(),
            performer_emoji: String::new(),
            result,
            tasks_before: 4,
            tasks_after: 3,
            duration_seconds: 60.0 * n as f64,
            started_at,
            ended_at: started_at + chrono::Duration::minutes(n),
            error_message: None,
        }
    }

    async fn seed(db: &TestDb) {
        let store = db.store();
        store
            .append(&record(1, "task", IterationResult::Success))
            .await
            .unwrap();
        store
            .append(&record(2, "cleanup", IterationResult::NoProgress))
            .await
            .unwrap();
        store
            .append(&record(3, "task", IterationResult::Success))
            .await
            .unwrap();
    }

    async fn next_frame<S>(body: &mut S) -> String
    where
        S: futures::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin,
    {
        let chunk = tokio::time::timeout(WAIT, body.next())
            .await
            .expect("timed out waiting for an SSE frame")
            .expect("SSE stream ended")
            .expect("SSE stream errored");
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_stopped_initially() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let resp = get(&state, "/api/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["running"], false);
        assert_eq!(json["paused"], false);
        assert_eq!(json["pid"], serde_json::Value::Null);

        db.teardown().await;
    }

    #[tokio::test]
    async fn start_rejects_invalid_options() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let resp = post(&state, "/api/start", serde_json::json!({"max_iterations": 0})).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json.get("pid").is_none());
        let error = json["error"].as_str().unwrap();
        assert!(error.contains("max_iterations"), "unexpected error: {error}");

        let resp = post(&state, "/api/start", serde_json::json!({"start_hour": 25})).await;
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);

        db.teardown().await;
    }

    #[tokio::test]
    async fn start_reports_spawn_failure() {
        let db = create_test_db().await;
        let missing = db.dir().join("no-such-agent");
        let state = app_state(&db, &missing.to_string_lossy());

        let resp = post(&state, "/api/start", serde_json::json!({})).await;
        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        let error = json["error"].as_str().unwrap();
        assert!(error.contains("failed to spawn"), "unexpected error: {error}");

        let json = body_json(get(&state, "/api/status").await).await;
        assert_eq!(json["status"], "stopped");

        db.teardown().await;
    }

    #[tokio::test]
    async fn commands_on_a_stopped_agent() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let json = body_json(post(&state, "/api/pause", serde_json::json!({})).await).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "agent is not running");

        let json = body_json(post(&state, "/api/resume", serde_json::json!({})).await).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["error"], serde_json::Value::Null);

        let json = body_json(post(&state, "/api/stop", serde_json::json!({})).await).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["outcome"], "not_running");

        db.teardown().await;
    }

    #[tokio::test]
    async fn stop_requires_a_json_body() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let app = super::build_router(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());

        db.teardown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_then_stop_a_fake_agent() {
        let db = create_test_db().await;
        let agent = overseer_test_utils::write_fake_agent(
            db.dir(),
            "agent.sh",
            "trap 'exit 0' TERM\nwhile true; do sleep 0.1; done",
        );
        let state = app_state(&db, &agent.to_string_lossy());

        let resp = post(
            &state,
            "/api/start",
            serde_json::json!({"performer": "task", "max_iterations": 3, "start_hour": 22, "end_hour": 8}),
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["success"], true, "start failed: {json}");
        let pid = json["pid"].as_u64().expect("start should report a pid");

        let json = body_json(get(&state, "/api/status").await).await;
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"].as_u64(), Some(pid));
        assert_eq!(json["performer"], "task");
        assert_eq!(json["max_iterations"], 3);
        assert_eq!(json["allowed_hours"], serde_json::json!({"start": 22, "end": 8}));

        let json = body_json(post(&state, "/api/start", serde_json::json!({})).await).await;
        assert_eq!(json["success"], false);

        let json = body_json(post(&state, "/api/stop", serde_json::json!({"force": false})).await).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["outcome"], "graceful");

        let json = body_json(get(&state, "/api/status").await).await;
        assert_eq!(json["status"], "stopped");

        db.teardown().await;
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn history_empty() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let json = body_json(get(&state, "/api/history").await).await;
        assert_eq!(json["records"], serde_json::json!([]));
        assert_eq!(json["total"], 0);
        assert_eq!(json["has_more"], false);

        db.teardown().await;
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let db = create_test_db().await;
        seed(&db).await;
        let state = app_state(&db, "autoclaude");

        let json = body_json(get(&state, "/api/history?limit=2").await).await;
        let records = json["records"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["iteration_number"], 3);
        assert_eq!(records[1]["iteration_number"], 2);
        assert_eq!(json["total"], 3);
        assert_eq!(json["has_more"], true);

        let json = body_json(get(&state, "/api/history?limit=2&offset=2").await).await;
        assert_eq!(json["records"].as_array().unwrap().len(), 1);
        assert_eq!(json["has_more"], false);

        db.teardown().await;
    }

    #[tokio::test]
    async fn history_filters_by_result_and_performer() {
        let db = create_test_db().await;
        seed(&db).await;
        let state = app_state(&db, "autoclaude");

        let json = body_json(get(&state, "/api/history?result=success").await).await;
        assert_eq!(json["total"], 2);

        let json = body_json(get(&state, "/api/history?performer=cleanup").await).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["records"][0]["result"], "no_progress");

        let json =
            body_json(get(&state, "/api/history?result=success&performer=cleanup").await).await;
        assert_eq!(json["total"], 0);

        db.teardown().await;
    }

    #[tokio::test]
    async fn history_rejects_unknown_result() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let resp = get(&state, "/api/history?result=exploded").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        db.teardown().await;
    }

    #[tokio::test]
    async fn history_stats_and_performers() {
        let db = create_test_db().await;
        seed(&db).await;
        let state = app_state(&db, "autoclaude");

        let json = body_json(get(&state, "/api/history/stats").await).await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["success_count"], 2);
        assert_eq!(json["no_progress_count"], 1);
        assert_eq!(json["error_count"], 0);
        assert_eq!(json["avg_duration_seconds"], 120.0);

        let json = body_json(get(&state, "/api/history/performers").await).await;
        assert_eq!(json, serde_json::json!(["cleanup", "task"]));

        db.teardown().await;
    }

    #[tokio::test]
    async fn history_record_by_id() {
        let db = create_test_db().await;
        let stored = db
            .store()
            .append(&record(1, "task", IterationResult::Success))
            .await
            .unwrap();
        let state = app_state(&db, "autoclaude");

        let resp = get(&state, &format!("/api/history/{}", stored.id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["performer_name"], "task");

        let resp = get(&state, "/api/history/9999").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "iteration record 9999 not found");

        db.teardown().await;
    }

    #[tokio::test]
    async fn history_query_failure_is_an_internal_error() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");
        db.pool.close().await;

        let resp = get(&state, "/api/history/stats").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert!(json["error"].is_string());
    }

    // -----------------------------------------------------------------------
    // Live events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn live_events_start_with_connected_and_forward_published_events() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");
        let broadcaster = state.supervisor.broadcaster().clone();

        let resp = get(&state, "/api/events").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap()
            .to_string();
        assert!(
            content_type.starts_with("text/event-stream"),
            "unexpected content-type: {content_type}"
        );
        assert_eq!(broadcaster.subscriber_count().await, 1);

        let mut body = resp.into_body().into_data_stream();
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("event: connected"), "unexpected frame: {frame}");

        broadcaster
            .publish(LiveEvent::Error {
                message: "boom".to_string(),
            })
            .await;
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("event: error"), "unexpected frame: {frame}");
        assert!(frame.contains(r#""message":"boom""#), "unexpected frame: {frame}");

        drop(body);
        tokio::time::timeout(WAIT, async {
            while broadcaster.subscriber_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("subscriber should be unregistered after disconnect");

        db.teardown().await;
    }

    #[tokio::test]
    async fn live_events_end_on_shutdown() {
        let db = create_test_db().await;
        let state = app_state(&db, "autoclaude");

        let resp = get(&state, "/api/events").await;
        let mut body = resp.into_body().into_data_stream();
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("event: connected"));

        state.shutdown.cancel();
        let end = tokio::time::timeout(WAIT, body.next())
            .await
            .expect("stream should end after shutdown");
        assert!(end.is_none(), "expected end of stream, got {end:?}");

        db.teardown().await;
    }
}
