// src/server.rs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::approvals::{ApprovalDecision, ApprovalItem};
use crate::bc_client::{BcError, BcJobPlanningLine, BcJobTask};
use crate::config::AppConfig;
use crate::entry_store::{EntryPatch, EntryStore, StoreError};
use crate::pricing::{PriceBoard, Quote};
use crate::reporting::{self, HoursReport, ProjectSummary, UtilizationRow};
use crate::sync::{DayTotal, SyncError, SyncReport, TimesheetSynchronizer, WeekView};
use crate::time_entries::{
    calculate_total_hours, next_week, previous_week, round_hours, week_grid, week_start,
    TimeEntry, DATE_FORMAT,
};
use crate::timer::{RunningTimer, TimerError, TimerStore};
use crate::uom;

const MAX_HOURS_PER_ENTRY: f64 = 24.0;
const LOCAL_USER: &str = "local";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Business Central error")]
    Bc(#[from] BcError),
    #[error("Synchronization error")]
    Sync(#[from] SyncError),
    #[error("Entry store error")]
    Store(#[from] StoreError),
    #[error("Timer error")]
    Timer(#[from] TimerError),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

fn bc_status(err: &BcError) -> (StatusCode, String) {
    match err {
        BcError::MissingToken => (
            StatusCode::UNAUTHORIZED,
            "Business Central token not available. Please sign in.".to_string(),
        ),
        BcError::RateLimitExceeded => (
            StatusCode::TOO_MANY_REQUESTS,
            "Business Central rate limit exceeded. Please try again later.".to_string(),
        ),
        BcError::NotFound(message) => (StatusCode::NOT_FOUND, message.clone()),
        BcError::Api { status, message } => {
            let status = StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let status = if status.is_server_error() {
                StatusCode::BAD_GATEWAY
            } else {
                status
            };
            (status, message.clone())
        }
        BcError::Request(_) => (
            StatusCode::BAD_GATEWAY,
            "Failed to connect to Business Central.".to_string(),
        ),
        BcError::Json(_)
        | BcError::Io { .. }
        | BcError::UrlParse(_)
        | BcError::Time(_)
        | BcError::Config(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error.".to_string(),
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Error occurred: {:?}", self);
        let (status_code, message) = match &self {
            AppError::Bc(e) => bc_status(e),
            AppError::Sync(sync_err) => match sync_err {
                SyncError::Bc(e) => bc_status(e),
                SyncError::Store(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Local entry store failed.".to_string(),
                ),
                SyncError::NoTimeSheet { .. } => (StatusCode::NOT_FOUND, sync_err.to_string()),
                SyncError::InvalidEntry(_) => (StatusCode::BAD_REQUEST, sync_err.to_string()),
                SyncError::Forbidden(_) => (StatusCode::FORBIDDEN, sync_err.to_string()),
            },
            AppError::Store(StoreError::NotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("Time entry {} not found", id))
            }
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Local entry store failed.".to_string(),
            ),
            AppError::Timer(timer_err @ (TimerError::AlreadyRunning(_) | TimerError::NotRunning)) => {
                (StatusCode::CONFLICT, timer_err.to_string())
            }
            AppError::Timer(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Timer storage failed.".to_string(),
            ),
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
        };
        (status_code, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub synchronizer: Arc<TimesheetSynchronizer>,
    pub entries: Arc<Mutex<EntryStore>>,
    pub timer: Arc<Mutex<TimerStore>>,
    pub prices: Arc<PriceBoard>,
}

impl AppState {
    fn resource(&self, requested: Option<String>) -> Result<String, AppError> {
        requested
            .or_else(|| self.config.default_resource.clone())
            .ok_or_else(|| AppError::BadRequest("resource is required".to_string()))
    }

    fn user_id(&self) -> String {
        self.config
            .default_resource
            .clone()
            .unwrap_or_else(|| LOCAL_USER.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    let static_files = ServeDir::new(&state.config.static_dir);

    let api_routes = Router::new()
        .route("/week", get(handle_get_week))
        .route("/week/submit", post(handle_submit_week))
        .route("/entries", get(handle_list_entries).post(handle_create_entry))
        .route("/entries/sync", post(handle_sync_entries))
        .route(
            "/entries/{id}",
            put(handle_update_entry).delete(handle_delete_entry),
        )
        .route("/timer", get(handle_get_timer))
        .route("/timer/start", post(handle_start_timer))
        .route("/timer/stop", post(handle_stop_timer))
        .route("/approvals", get(handle_list_approvals))
        .route("/approvals/{sheet}/{decision}", post(handle_decide_approval))
        .route("/utilization", get(handle_utilization))
        .route("/projects/{job_no}", get(handle_project_summary))
        .route("/projects/{job_no}/tasks", get(handle_job_tasks))
        .route("/projects/{job_no}/plan", post(handle_plan_hours))
        .route("/reports/hours", get(handle_hours_report))
        .route("/pricing", get(handle_pricing))
        .route("/cache/clear", post(handle_clear_cache));

    Router::new()
        .nest("/api", api_routes)
        .route("/status", get(handle_status))
        .fallback_service(static_files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Request parsing ---

fn parse_date(value: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| AppError::BadRequest(format!("invalid date '{}', expected YYYY-MM-DD", value)))
}

fn date_or_today(value: Option<&str>) -> Result<NaiveDate, AppError> {
    match value {
        Some(value) => parse_date(value),
        None => Ok(Local::now().date_naive()),
    }
}

fn validate_hours(hours: f64) -> Result<(), AppError> {
    if !hours.is_finite() || !(0.0..=MAX_HOURS_PER_ENTRY).contains(&hours) {
        return Err(AppError::BadRequest(format!(
            "hours must be between 0 and {}",
            MAX_HOURS_PER_ENTRY
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct WeekParams {
    resource: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceParams {
    resource: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserParams {
    user: String,
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    from: String,
    to: String,
}

impl RangeParams {
    fn dates(&self) -> Result<(NaiveDate, NaiveDate), AppError> {
        let from = parse_date(&self.from)?;
        let to = parse_date(&self.to)?;
        if from > to {
            return Err(AppError::BadRequest("'from' is after 'to'".to_string()));
        }
        Ok((from, to))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntryRequest {
    project_id: String,
    task_id: Option<String>,
    date: String,
    hours: f64,
    notes: Option<String>,
    #[serde(default = "default_billable")]
    is_billable: bool,
}

fn default_billable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTimerRequest {
    project_id: String,
    task_id: Option<String>,
    notes: Option<String>,
    #[serde(default = "default_billable")]
    is_billable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanHoursRequest {
    job_task_no: String,
    resource_no: String,
    hours: f64,
    date: String,
}

// --- Responses ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalWeek {
    pub week_start: String,
    pub previous_week: String,
    pub next_week: String,
    pub entries: Vec<TimeEntry>,
    pub grid: Vec<DayTotal>,
    pub total_hours: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    pub running: Option<RunningTimer>,
    pub elapsed_secs: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingView {
    pub price_sats: u64,
    pub quotes: Vec<Quote>,
    pub last_updated: Option<String>,
}

// --- Handlers ---

async fn handle_status(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    info!("Handling /status request...");
    let token_status = state.synchronizer.client().token_status().await?;
    let (entry_count, pending_count) = {
        let store = state.entries.lock().await;
        (store.len(), store.pending().len())
    };
    let prices_updated = state
        .prices
        .last_updated()
        .await
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());

    let html_body = format!(
        "<h1>Thyme Status</h1><p>Current Time (Server): {}</p>\
         <p>Token Status: has_token={}, is_valid={}, is_expired={}, expires_in={}s, expires_at={}</p><hr>\
         <p>Cached Time Entries: {} ({} pending)</p>\
         <p>Prices Last Updated: {}</p>",
        Local::now().to_rfc3339(),
        token_status.has_token,
        token_status.is_valid,
        token_status.is_expired,
        token_status.expires_in_secs,
        token_status.expires_at,
        entry_count,
        pending_count,
        prices_updated
    );
    Ok(Html(html_body))
}

async fn handle_get_week(
    State(state): State<AppState>,
    Query(params): Query<WeekParams>,
) -> Result<Json<WeekView>, AppError> {
    let resource = state.resource(params.resource)?;
    let date = date_or_today(params.date.as_deref())?;
    Ok(Json(state.synchronizer.fetch_week(&resource, date).await?))
}

async fn handle_submit_week(
    State(state): State<AppState>,
    Query(params): Query<WeekParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resource = state.resource(params.resource)?;
    let date = date_or_today(params.date.as_deref())?;
    let submitted = state.synchronizer.submit_week(&resource, date).await?;
    Ok(Json(json!({ "submitted": submitted })))
}

async fn handle_list_entries(
    State(state): State<AppState>,
    Query(params): Query<WeekParams>,
) -> Result<Json<LocalWeek>, AppError> {
    let start = week_start(date_or_today(params.date.as_deref())?);
    let entries = state.entries.lock().await.for_week(start);
    let grid = week_grid(&entries, start)
        .into_iter()
        .map(|(date, hours)| DayTotal { date, hours })
        .collect();
    Ok(Json(LocalWeek {
        week_start: start.format(DATE_FORMAT).to_string(),
        previous_week: previous_week(start).format(DATE_FORMAT).to_string(),
        next_week: next_week(start).format(DATE_FORMAT).to_string(),
        total_hours: round_hours(calculate_total_hours(&entries)),
        entries,
        grid,
    }))
}

async fn handle_create_entry(
    State(state): State<AppState>,
    Json(request): Json<NewEntryRequest>,
) -> Result<(StatusCode, Json<TimeEntry>), AppError> {
    let date = parse_date(&request.date)?;
    validate_hours(request.hours)?;
    if request.project_id.trim().is_empty() {
        return Err(AppError::BadRequest("projectId is required".to_string()));
    }

    let mut entry = TimeEntry::new(&request.project_id, &state.user_id(), date, request.hours, Utc::now())
        .notes(request.notes.as_deref())
        .billable(request.is_billable);
    entry.task_id = request.task_id;

    let created = state.entries.lock().await.add(entry)?;
    info!("Created time entry {} for {}", created.id, created.date);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn handle_update_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<EntryPatch>,
) -> Result<Json<TimeEntry>, AppError> {
    if let Some(date) = patch.date.as_deref() {
        parse_date(date)?;
    }
    if let Some(hours) = patch.hours {
        validate_hours(hours)?;
    }
    let updated = state.entries.lock().await.update(&id, patch, Utc::now())?;
    Ok(Json(updated))
}

async fn handle_delete_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let removed = state.entries.lock().await.remove(&id)?;
    if removed.bc_line_id.is_some() {
        warn!(
            "Deleted entry {} was already synced; its ERP line is left untouched",
            removed.id
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_sync_entries(
    State(state): State<AppState>,
    Query(params): Query<ResourceParams>,
) -> Result<Json<SyncReport>, AppError> {
    let resource = state.resource(params.resource)?;
    let report = state
        .synchronizer
        .sync_pending(&state.entries, &resource)
        .await?;
    Ok(Json(report))
}

async fn handle_get_timer(State(state): State<AppState>) -> Json<TimerView> {
    let timer = state.timer.lock().await;
    Json(TimerView {
        running: timer.running().cloned(),
        elapsed_secs: timer.elapsed_secs(Utc::now()),
    })
}

async fn handle_start_timer(
    State(state): State<AppState>,
    Json(request): Json<StartTimerRequest>,
) -> Result<Json<RunningTimer>, AppError> {
    let running = state.timer.lock().await.start(
        &request.project_id,
        request.task_id.as_deref(),
        request.notes.as_deref(),
        request.is_billable,
        Utc::now(),
    )?;
    Ok(Json(running))
}

async fn handle_stop_timer(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<TimeEntry>), AppError> {
    let entry = state.timer.lock().await.stop(&state.user_id(), Utc::now())?;
    let created = state.entries.lock().await.add(entry)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn handle_list_approvals(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Result<Json<Vec<ApprovalItem>>, AppError> {
    Ok(Json(state.synchronizer.pending_approvals(&params.user).await?))
}

async fn handle_decide_approval(
    State(state): State<AppState>,
    Path((sheet, decision)): Path<(String, String)>,
    Query(params): Query<UserParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let decision: ApprovalDecision = decision.parse().map_err(AppError::BadRequest)?;
    let decided = state
        .synchronizer
        .decide(&params.user, &sheet, decision)
        .await?;
    Ok(Json(json!({ "timeSheetNo": sheet, "decision": decision, "lines": decided })))
}

async fn handle_utilization(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<UtilizationRow>>, AppError> {
    let (from, to) = params.dates()?;
    let client = state.synchronizer.client();
    let resources = client.get_resources().await?;
    let records = client.get_resource_units_of_measure().await?;

    let mut by_resource: HashMap<String, Vec<TimeEntry>> = HashMap::new();
    for entry in state.entries.lock().await.list() {
        by_resource
            .entry(entry.user_id.clone())
            .or_default()
            .push(entry.clone());
    }
    Ok(Json(reporting::team_utilization(
        &resources,
        &by_resource,
        &records,
        from,
        to,
    )))
}

async fn handle_project_summary(
    State(state): State<AppState>,
    Path(job_no): Path<String>,
) -> Result<Json<ProjectSummary>, AppError> {
    let client = state.synchronizer.client();
    let job = client.get_job(&job_no).await?;
    let planning_lines = client.get_job_planning_lines(&job_no).await?;
    let map = uom::build(&client.get_resource_units_of_measure().await?);
    let entries = state.entries.lock().await.list().to_vec();
    Ok(Json(reporting::project_summary(
        &job,
        &planning_lines,
        &map,
        &entries,
    )))
}

async fn handle_job_tasks(
    State(state): State<AppState>,
    Path(job_no): Path<String>,
) -> Result<Json<Vec<BcJobTask>>, AppError> {
    Ok(Json(state.synchronizer.client().get_job_tasks(&job_no).await?))
}

async fn handle_plan_hours(
    State(state): State<AppState>,
    Path(job_no): Path<String>,
    Json(request): Json<PlanHoursRequest>,
) -> Result<(StatusCode, Json<BcJobPlanningLine>), AppError> {
    let date = parse_date(&request.date)?;
    if !request.hours.is_finite() || request.hours <= 0.0 {
        return Err(AppError::BadRequest("hours must be positive".to_string()));
    }
    let line = state
        .synchronizer
        .plan_hours(
            &job_no,
            &request.job_task_no,
            &request.resource_no,
            request.hours,
            date,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(line)))
}

async fn handle_hours_report(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<HoursReport>, AppError> {
    let (from, to) = params.dates()?;
    let store = state.entries.lock().await;
    Ok(Json(reporting::hours_report(store.list(), from, to)))
}

async fn handle_pricing(State(state): State<AppState>) -> Json<PricingView> {
    Json(PricingView {
        price_sats: state.prices.price_sats(),
        quotes: state.prices.quotes().await,
        last_updated: state.prices.last_updated().await.map(|t| t.to_rfc3339()),
    })
}

async fn handle_clear_cache(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.synchronizer.client().clear_all_cache()?;
    info!("Reference data cache cleared");
    Ok(StatusCode::NO_CONTENT)
}
