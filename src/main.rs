use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod calendar;
mod config;
mod dashboard;
mod error;
mod history;
mod models;
mod persistence;
mod projections;
mod session;
mod store;


use config::Config;
use dashboard::{Dashboard, SharedDashboard};
use error::{DashboardError, ValidationError};
use models::{ApiResponse, BatchInput, EventInput};
use persistence::JsonFileStore;

/// Visitor tally HTTP API
/// Events are appended to the live session only; every statistic is
/// derived from the session log or the archive on read.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    let backend = Arc::new(JsonFileStore::open(&config.data_dir)?);
    let dashboard: SharedDashboard = Arc::new(Dashboard::open(&config, backend)?);

    let app = router(dashboard.clone());

    let addr = config.bind_addr()?;
    info!(%addr, data_dir = %config.data_dir.display(), "server running");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = dashboard.flush_session().await {
        error!(error = %e, "session still unsaved at shutdown");
    }
    if let Err(e) = dashboard.flush_archive().await {
        error!(error = %e, "archive still unsaved at shutdown");
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}

fn router(dashboard: SharedDashboard) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/events", get(list_events).post(create_event))
        .route("/events/batch", post(create_batch))
        .route("/events/undo", post(undo_last_event))
        .route("/stats", get(get_overview))
        .route("/stats/minutes", get(get_minute_stats))
        .route("/stats/ten-minutes", get(get_ten_minute_stats))
        .route("/stats/running-total", get(get_running_total))
        .route("/stats/peak", get(get_peak))
        .route("/stats/average", get(get_average))
        .route("/stats/recent", get(get_recent))
        .route("/historical", get(get_historical))
        .route("/historical/detailed", get(get_detailed_historical))
        .route("/live", get(get_live_status))
        .route("/live/toggle", post(toggle_live))
        .route("/summary", get(get_summary))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dashboard)
}

async fn root() -> &'static str {
    "Visitor Tally API v0.1.0"
}

async fn health_check(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": calendar::format_timestamp(&calendar::now()),
        "live_mode": dashboard.is_live().await,
    }))
}

/// Current session, chronological
async fn list_events(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    let events = dashboard.current_data().await;
    Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    }))
}

/// Record visitors (defaults: now, one visitor)
async fn create_event(
    State(dashboard): State<SharedDashboard>,
    Json(input): Json<EventInput>,
) -> Result<Json<ApiResponse>, DashboardError> {
    let outcome = dashboard.append(&input).await?;
    info!(
        timestamp = %outcome.event.timestamp,
        count = outcome.event.count,
        total = outcome.total_count,
        "visitors recorded"
    );
    Ok(Json(ApiResponse::success(
        format!("{} visitor(s) recorded", outcome.event.count),
        serde_json::json!(outcome),
    )))
}

async fn create_batch(
    State(dashboard): State<SharedDashboard>,
    Json(batch): Json<BatchInput>,
) -> Result<Json<ApiResponse>, DashboardError> {
    let outcome = dashboard.append_batch(&batch.events).await?;
    Ok(Json(ApiResponse::success(
        format!("{} entries uploaded", outcome.accepted),
        serde_json::json!(outcome),
    )))
}

async fn undo_last_event(
    State(dashboard): State<SharedDashboard>,
) -> Result<Json<ApiResponse>, DashboardError> {
    let outcome = dashboard.undo_last().await?;
    Ok(Json(ApiResponse::success(
        "Last entry removed",
        serde_json::json!(outcome),
    )))
}

async fn get_overview(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!(dashboard.overview(calendar::now()).await))
}

async fn get_minute_stats(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "minutes": dashboard.minute_stats().await }))
}

async fn get_ten_minute_stats(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ten_minutes": dashboard.ten_minute_stats().await }))
}

async fn get_running_total(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "running_total": dashboard.running_total().await }))
}

#[derive(Debug, Deserialize)]
struct PeakQuery {
    window: Option<usize>,
}

async fn get_peak(
    State(dashboard): State<SharedDashboard>,
    Query(query): Query<PeakQuery>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "peak": dashboard.peak(query.window).await }))
}

async fn get_average(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "average": dashboard.average().await }))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    minutes: Option<i64>,
}

async fn get_recent(
    State(dashboard): State<SharedDashboard>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let window = match query.minutes {
        Some(minutes) => chrono::Duration::try_minutes(minutes)
            .filter(|window| *window >= chrono::Duration::zero())
            .ok_or(ValidationError::Query {
                name: "minutes",
                value: minutes.to_string(),
            })?,
        None => dashboard.recent_window(),
    };
    let sum = dashboard.recent_window_sum(calendar::now(), Some(window)).await;
    Ok(Json(serde_json::json!({
        "recent_count": sum,
        "window_minutes": window.num_minutes(),
    })))
}

#[derive(Debug, Deserialize)]
struct HistoricalQuery {
    years: Option<String>,
}

/// Year-over-year slot stats, e.g. `?years=2023,2024`
async fn get_historical(
    State(dashboard): State<SharedDashboard>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let years = selected_years(&query)?;
    let comparison = dashboard.historical_comparison(years.as_deref()).await;
    Ok(Json(serde_json::json!(comparison)))
}

/// Every archived entry per year, oldest first, for per-arrival charts
async fn get_detailed_historical(
    State(dashboard): State<SharedDashboard>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<serde_json::Value>, DashboardError> {
    let years = selected_years(&query)?;
    let detailed = dashboard.detailed_historical(years.as_deref()).await;
    Ok(Json(serde_json::json!(detailed)))
}

/// `None` means every year, including for a blank `?years=`.
fn selected_years(query: &HistoricalQuery) -> Result<Option<Vec<i32>>, ValidationError> {
    let years = query.years.as_deref().map(parse_years).transpose()?;
    Ok(years.filter(|years| !years.is_empty()))
}

fn parse_years(raw: &str) -> Result<Vec<i32>, ValidationError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i32>().map_err(|_| ValidationError::Query {
                name: "years",
                value: raw.to_string(),
            })
        })
        .collect()
}

async fn get_live_status(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!(dashboard.live_status(calendar::now()).await))
}

async fn toggle_live(State(dashboard): State<SharedDashboard>) -> Json<ApiResponse> {
    let outcome = dashboard.toggle_live(calendar::now()).await;
    let message = match (outcome.live.is_live, outcome.persistence_errors.is_empty()) {
        (true, _) => "Live mode enabled",
        (false, true) => "Live mode disabled",
        (false, false) => "Live mode disabled; archive update pending",
    };
    Json(ApiResponse::success(message, serde_json::json!(outcome)))
}

async fn get_summary(State(dashboard): State<SharedDashboard>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "summary": dashboard.summary().await }))
}
