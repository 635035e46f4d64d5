use std::sync::atomic::Ordering;
use std::sync::Arc;
use axum::{
    Router,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::GradebookError;
use crate::grade::calculator::{GradeInput, GradeResult};
use crate::grade::engine::{FeedbackView, GradeEngine};
use crate::grade::types::{
    Activity, ActivityId, Correction, CorrectionInput, CorrectionSort, NewActivity, NewStudent,
    Student, StudentId,
};
use crate::journal::JournalEntry;
use crate::mailer::OutgoingMail;
use crate::metrics;
use crate::summary::ActivitySummary;

/// JSON API server over the grade engine
pub struct WebServer {
    engine: Arc<GradeEngine>,
    config: Arc<Config>,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<GradeEngine>,
}

impl AppState {
    /// Count failures before they are turned into responses
    fn reply<T>(&self, result: crate::error::Result<T>) -> Result<Json<T>, ApiError> {
        result.map(Json).map_err(|e| {
            self.engine.metrics.api_errors.fetch_add(1, Ordering::Relaxed);
            ApiError(e)
        })
    }
}

/// Error body: {"error": "..."}
pub struct ApiError(GradebookError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GradebookError::NotFound { .. } => StatusCode::NOT_FOUND,
            GradebookError::Invalid(_) => StatusCode::BAD_REQUEST,
            GradebookError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API error: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// Malformed bodies, path segments and query strings get the same
// 400 {"error": ...} shape as domain validation failures.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(GradebookError::invalid(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(GradebookError::invalid(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(GradebookError::invalid(rejection.body_text()))
    }
}

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
struct ApiPath<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
struct ApiQuery<T>(T);

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
struct SortQuery {
    sort: Option<CorrectionSort>,
}

#[derive(Deserialize)]
struct JournalQuery {
    activity: Option<ActivityId>,
    student: Option<StudentId>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct Count {
    count: usize,
}

impl WebServer {
    pub fn new(engine: Arc<GradeEngine>, config: Arc<Config>) -> Self {
        Self { engine, config }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
        };

        let app = Router::new()
            .route("/", get(index))
            .route("/metrics", get(api_metrics))
            .route("/feedback/:token", get(feedback))
            .route("/api/health", get(health))
            .route("/api/stats", get(api_stats))
            .route("/api/grade/preview", post(preview))
            .route("/api/students", get(list_students).post(create_student))
            .route("/api/students/:id", get(get_student).delete(delete_student))
            .route("/api/activities", get(list_activities).post(create_activity))
            .route(
                "/api/activities/:id",
                get(get_activity).put(update_activity).delete(delete_activity),
            )
            .route("/api/activities/:id/corrections", get(list_corrections))
            .route(
                "/api/activities/:id/corrections/:student_id",
                get(get_correction).put(record_correction).delete(delete_correction),
            )
            .route(
                "/api/activities/:id/corrections/:student_id/never-submitted",
                post(never_submitted),
            )
            .route("/api/activities/:id/summary", get(summary))
            .route("/api/activities/:id/notify", post(notify))
            .route("/api/recompute", post(recompute))
            .route("/api/journal", get(api_journal))
            .route("/api/outbox", get(api_outbox))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if self.config.web.permissive_cors {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.web.address, self.config.web.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("🌐 Gradebook API listening on http://{}", addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until ctrl-c
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down web server");
            })
            .await?;
        Ok(())
    }
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "gradebook",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> &'static str {
    "ok"
}

async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.engine.get_stats())
}

async fn api_metrics(State(state): State<AppState>) -> String {
    metrics::render_metrics(&state.engine)
}

/// Stateless calculation under the configured policy
async fn preview(State(state): State<AppState>, ApiJson(input): ApiJson<GradeInput>) -> Json<GradeResult> {
    Json(state.engine.preview(&input))
}

// ── students ─────────────────────────────────────────

async fn list_students(State(state): State<AppState>) -> Json<Vec<Student>> {
    Json(state.engine.list_students())
}

async fn create_student(
    State(state): State<AppState>,
    ApiJson(new): ApiJson<NewStudent>,
) -> Result<(StatusCode, Json<Student>), ApiError> {
    let student = state.reply(state.engine.create_student(new))?;
    Ok((StatusCode::CREATED, student))
}

async fn get_student(State(state): State<AppState>, ApiPath(id): ApiPath<StudentId>) -> ApiResult<Student> {
    state.reply(state.engine.get_student(id))
}

async fn delete_student(State(state): State<AppState>, ApiPath(id): ApiPath<StudentId>) -> ApiResult<Student> {
    state.reply(state.engine.delete_student(id))
}

// ── activities ───────────────────────────────────────

async fn list_activities(State(state): State<AppState>) -> Json<Vec<Activity>> {
    Json(state.engine.list_activities())
}

async fn create_activity(
    State(state): State<AppState>,
    ApiJson(new): ApiJson<NewActivity>,
) -> Result<(StatusCode, Json<Activity>), ApiError> {
    let activity = state.reply(state.engine.create_activity(new))?;
    Ok((StatusCode::CREATED, activity))
}

async fn get_activity(State(state): State<AppState>, ApiPath(id): ApiPath<ActivityId>) -> ApiResult<Activity> {
    state.reply(state.engine.get_activity(id))
}

async fn update_activity(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<ActivityId>,
    ApiJson(new): ApiJson<NewActivity>,
) -> ApiResult<Activity> {
    state.reply(state.engine.update_activity(id, new))
}

async fn delete_activity(State(state): State<AppState>, ApiPath(id): ApiPath<ActivityId>) -> ApiResult<Activity> {
    state.reply(state.engine.delete_activity(id))
}

async fn summary(State(state): State<AppState>, ApiPath(id): ApiPath<ActivityId>) -> ApiResult<ActivitySummary> {
    state.reply(state.engine.summary(id))
}

async fn notify(State(state): State<AppState>, ApiPath(id): ApiPath<ActivityId>) -> ApiResult<Count> {
    state.reply(state.engine.notify_activity(id).map(|count| Count { count }))
}

// ── corrections ──────────────────────────────────────

async fn list_corrections(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<ActivityId>,
    ApiQuery(params): ApiQuery<SortQuery>,
) -> ApiResult<Vec<Correction>> {
    state.reply(state.engine.list_corrections(id, params.sort.unwrap_or_default()))
}

async fn get_correction(
    State(state): State<AppState>,
    ApiPath((id, student_id)): ApiPath<(ActivityId, StudentId)>,
) -> ApiResult<Correction> {
    state.reply(state.engine.get_correction(id, student_id))
}

async fn record_correction(
    State(state): State<AppState>,
    ApiPath((id, student_id)): ApiPath<(ActivityId, StudentId)>,
    ApiJson(input): ApiJson<CorrectionInput>,
) -> ApiResult<Correction> {
    state.reply(state.engine.record_correction(id, student_id, input))
}

async fn delete_correction(
    State(state): State<AppState>,
    ApiPath((id, student_id)): ApiPath<(ActivityId, StudentId)>,
) -> ApiResult<Correction> {
    state.reply(state.engine.delete_correction(id, student_id))
}

async fn never_submitted(
    State(state): State<AppState>,
    ApiPath((id, student_id)): ApiPath<(ActivityId, StudentId)>,
) -> ApiResult<Correction> {
    state.reply(state.engine.mark_never_submitted(id, student_id))
}

async fn recompute(State(state): State<AppState>) -> Json<Count> {
    Json(Count { count: state.engine.recompute_all() })
}

// ── journal / outbox / feedback ──────────────────────

async fn api_journal(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<JournalQuery>,
) -> Json<Vec<JournalEntry>> {
    let limit = params.limit.unwrap_or(100);
    Json(state.engine.journal.search(params.activity, params.student, limit))
}

async fn api_outbox(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<LimitQuery>,
) -> Json<Vec<OutgoingMail>> {
    Json(state.engine.mailer.recent(params.limit.unwrap_or(100)))
}

/// Student-facing view behind an emailed link
async fn feedback(State(state): State<AppState>, ApiPath(token): ApiPath<String>) -> ApiResult<FeedbackView> {
    state.reply(state.engine.feedback(&token))
}
