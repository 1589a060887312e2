// HTTP API routes (submission intake, judge callbacks, match queries,
// administrative operations).

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::engine::Arena;
use crate::error::Error;
use crate::metrics;
use crate::models::{MatchDoc, Role, RoundExtra, RoundStatus, Submission};
use crate::mq::Task;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSubmissionRequest {
    pub user_id: i64,
    pub code: String,
}

#[derive(Deserialize)]
pub struct UserParams {
    pub user_id: i64,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub role: Option<Role>,
}

#[derive(Deserialize)]
pub struct CompileStartRequest {
    pub token: String,
}

#[derive(Deserialize)]
pub struct CompileCompleteRequest {
    pub token: String,
    pub success: bool,
    #[serde(default)]
    pub text: String,
    pub exe_blob: Option<String>,
}

#[derive(Deserialize)]
pub struct CompileErrorRequest {
    pub token: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize)]
pub struct RoundCompleteRequest {
    pub exit_code: i32,
    pub log_blob: Option<String>,
    pub summary: Option<String>,
    pub used_time_ms: Option<i64>,
}

#[derive(Deserialize)]
pub struct LockRequest {
    pub locked: bool,
    pub reason: Option<String>,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub arena: Arc<Arena>,
    /// Workers poll tasks over HTTP; the receiver end of the dispatch
    /// channel is drained one task per request.
    pub task_rx: Arc<Mutex<UnboundedReceiver<Task>>>,
}

// ── Error helpers ─────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

fn error_response(err: Error) -> Response {
    match err {
        Error::Validation(msg) => json_error(StatusCode::BAD_REQUEST, &msg),
        Error::NotFound(what) => {
            json_error(StatusCode::NOT_FOUND, &format!("{what} not found"))
        }
        // Stale callbacks are routine under at-least-once delivery; the
        // worker gets a 200 so it does not retry forever.
        Error::TaskTokenMismatch => {
            (StatusCode::OK, Json(json!({ "ignored": true }))).into_response()
        }
        Error::SubmitRejected(hot) => (StatusCode::FORBIDDEN, Json(json!(hot))).into_response(),
        Error::Conflict => json_error(StatusCode::CONFLICT, "conflicting concurrent update"),
        Error::Db(e) => {
            tracing::error!("Database error: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
        Error::Serde(e) => {
            tracing::error!("Serialization error: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

// ── Response views ────────────────────────────────────────────────────

/// Submission as returned to clients: the raw code and the in-flight
/// task token stay server side.
fn submission_view(sub: &Submission) -> serde_json::Value {
    json!({
        "id": sub.id,
        "user_id": sub.user_id,
        "version": sub.version,
        "status": sub.status,
        "text": sub.text,
        "matches": sub.matches,
        "start_rating": sub.start_rating,
        "end_rating": sub.end_rating,
        "created_at": sub.created_at,
    })
}

fn match_view(doc: &MatchDoc) -> serde_json::Value {
    json!(doc)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(arena: Arc<Arena>, task_rx: UnboundedReceiver<Task>) -> Router {
    let state = AppState {
        arena,
        task_rx: Arc::new(Mutex::new(task_rx)),
    };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        // Users
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", get(get_user))
        // Submissions
        .route(
            "/api/submissions",
            get(submit_allowed).post(create_submission),
        )
        .route("/api/submissions/{id}", get(get_submission))
        .route("/api/submissions/{id}/matches", get(get_submission_matches))
        .route("/api/submissions/{id}/recompile", post(recompile_submission))
        // Standings
        .route("/api/scoreboard", get(get_scoreboard))
        // Matches
        .route("/api/matches/pending", get(pending_matches))
        .route("/api/matches/{id}", get(get_match))
        // Judge worker callbacks
        .route("/api/judge/submissions/{id}/start", post(judge_compile_start))
        .route(
            "/api/judge/submissions/{id}/complete",
            post(judge_compile_complete),
        )
        .route("/api/judge/submissions/{id}/error", post(judge_compile_error))
        .route(
            "/api/judge/matches/{id}/rounds/{round_id}/start",
            post(judge_round_start),
        )
        .route(
            "/api/judge/matches/{id}/rounds/{round_id}/complete",
            post(judge_round_complete),
        )
        // Worker task polling
        .route("/api/tasks/poll", post(poll_task))
        // Administration
        .route("/api/admin/matches/refresh", post(refresh_matches))
        .route(
            "/api/admin/submissions/reset-stuck",
            post(reset_stuck_submissions),
        )
        .route("/api/admin/lock", post(set_lock))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Basic handlers ────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn get_metrics() -> impl IntoResponse {
    (StatusCode::OK, metrics::gather_metrics())
}

// ── User handlers ─────────────────────────────────────────────────────

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> impl IntoResponse {
    if req.name.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "name is required");
    }
    let role = req.role.unwrap_or(Role::Student);
    let score = state.arena.config.initial_score;
    match state.arena.db.create_user(&req.name, role, score).await {
        Ok(user) => (StatusCode::CREATED, Json(json!(user))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_user(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.arena.db.get_user(id).await {
        Ok(v) => (StatusCode::OK, Json(json!(v.doc))).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Submission handlers ───────────────────────────────────────────────

async fn create_submission(
    State(state): State<AppState>,
    Json(req): Json<CreateSubmissionRequest>,
) -> impl IntoResponse {
    if req.code.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "code is required");
    }
    match state.arena.create_submission(req.user_id, req.code).await {
        Ok(sub) => (StatusCode::CREATED, Json(submission_view(&sub))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn submit_allowed(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> impl IntoResponse {
    match state.arena.submit_hot_status(params.user_id).await {
        Ok(hot) => (StatusCode::OK, Json(json!(hot))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_submission(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.arena.get_submission(id).await {
        Ok(sub) => (StatusCode::OK, Json(submission_view(&sub))).into_response(),
        Err(e) => error_response(e),
    }
}

/// The submission's matches, each annotated with the outcome from this
/// submission's side.
async fn get_submission_matches(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.arena.get_matches_for_submission(id).await {
        Ok(docs) => {
            let views: Vec<_> = docs
                .iter()
                .map(|doc| {
                    let mut view = match_view(doc);
                    view["relative_status"] =
                        json!(doc.status.relative_to(doc.u1_submission == id));
                    view
                })
                .collect();
            (StatusCode::OK, Json(json!(views))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn recompile_submission(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.arena.recompile(id).await {
        Ok(sub) => (StatusCode::OK, Json(submission_view(&sub))).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Standings ─────────────────────────────────────────────────────────

async fn get_scoreboard(State(state): State<AppState>) -> impl IntoResponse {
    match state.arena.get_scoreboard().await {
        Ok(rows) => (StatusCode::OK, Json(json!(rows.as_slice()))).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Match handlers ────────────────────────────────────────────────────

async fn get_match(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.arena.get_match(id).await {
        Ok(doc) => (StatusCode::OK, Json(match_view(&doc))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn pending_matches(State(state): State<AppState>) -> impl IntoResponse {
    match state.arena.get_pending_matches().await {
        Ok(docs) => {
            let views: Vec<_> = docs.iter().map(match_view).collect();
            (StatusCode::OK, Json(json!(views))).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ── Judge callbacks ───────────────────────────────────────────────────

async fn judge_compile_start(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CompileStartRequest>,
) -> impl IntoResponse {
    match state.arena.judge_start_compile(id, &req.token).await {
        Ok(applied) => (StatusCode::OK, Json(json!({ "applied": applied }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn judge_compile_complete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CompileCompleteRequest>,
) -> impl IntoResponse {
    let result = state
        .arena
        .judge_complete_compile(id, &req.token, req.success, req.text, req.exe_blob)
        .await;
    match result {
        Ok(applied) => (StatusCode::OK, Json(json!({ "applied": applied }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn judge_compile_error(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CompileErrorRequest>,
) -> impl IntoResponse {
    match state.arena.judge_set_system_error(id, &req.token, req.text).await {
        Ok(applied) => (StatusCode::OK, Json(json!({ "applied": applied }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn judge_round_start(
    State(state): State<AppState>,
    Path((id, round_id)): Path<(i64, Uuid)>,
) -> impl IntoResponse {
    match state.arena.judge_start_round(id, round_id).await {
        Ok(applied) => (StatusCode::OK, Json(json!({ "applied": applied }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn judge_round_complete(
    State(state): State<AppState>,
    Path((id, round_id)): Path<(i64, Uuid)>,
    Json(req): Json<RoundCompleteRequest>,
) -> impl IntoResponse {
    let status = RoundStatus::from_judge_exit_code(req.exit_code);
    let extra = RoundExtra {
        log_blob: req.log_blob,
        summary: req.summary,
        used_time_ms: req.used_time_ms,
    };
    match state.arena.judge_complete_round(id, round_id, status, extra).await {
        Ok(applied) => (StatusCode::OK, Json(json!({ "applied": applied }))).into_response(),
        Err(e) => error_response(e),
    }
}

/// Hand out the next queued compile/judge task, or 204 when the queue
/// is empty.
async fn poll_task(State(state): State<AppState>) -> impl IntoResponse {
    let mut rx = state.task_rx.lock().await;
    match rx.try_recv() {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

// ── Administrative handlers ───────────────────────────────────────────

async fn refresh_matches(State(state): State<AppState>) -> impl IntoResponse {
    match state.arena.refresh_all_matches().await {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn reset_stuck_submissions(State(state): State<AppState>) -> impl IntoResponse {
    match state.arena.reset_stuck_submissions().await {
        Ok(touched) => (StatusCode::OK, Json(json!({ "touched": touched }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn set_lock(
    State(state): State<AppState>,
    Json(req): Json<LockRequest>,
) -> impl IntoResponse {
    match state
        .arena
        .set_submission_lock(req.locked, req.reason.as_deref())
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "locked": req.locked }))).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HotStatus;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("match"), StatusCode::NOT_FOUND),
            (Error::TaskTokenMismatch, StatusCode::OK),
            (
                Error::SubmitRejected(HotStatus::CooldownLimit { remaining_ms: 100 }),
                StatusCode::FORBIDDEN,
            ),
            (Error::Conflict, StatusCode::CONFLICT),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).status(), expected);
        }
    }

    #[test]
    fn test_submission_view_hides_code_and_token() {
        let sub = Submission {
            id: 1,
            user_id: 2,
            version: 1,
            code: "secret source".into(),
            status: crate::models::SubmissionStatus::Pending,
            text: String::new(),
            task_token: Some("token".into()),
            exe_blob: None,
            matches: Vec::new(),
            start_rating: None,
            end_rating: None,
            created_at: chrono::Utc::now(),
        };
        let view = submission_view(&sub);
        assert!(view.get("code").is_none());
        assert!(view.get("task_token").is_none());
        assert_eq!(view["id"], 1);
    }
}
