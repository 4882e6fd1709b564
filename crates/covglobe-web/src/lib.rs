//! Axum JSON read API over stored daily reports.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use covglobe_core::ReportDate;
use covglobe_storage::{RecordStore, StoreError};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "covglobe-web";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    clock: Clock,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            clock: Arc::new(Utc::now),
        }
    }

    /// Fix "now" for the `/api/data/today` lookup.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api", get(health_handler))
        .route("/api/data", get(all_records_handler))
        .route("/api/data/today", get(today_handler))
        .route("/api/data/range", get(range_handler))
        .route("/api/data/{date}", get(record_by_date_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving report API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000)
}

async fn health_handler() -> &'static str {
    "COVID-19 daily report API"
}

async fn all_records_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.find_all().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn today_handler(State(state): State<Arc<AppState>>) -> Response {
    let date = ReportDate::latest_published((state.clock)()).key();
    lookup(&state, &date).await
}

async fn range_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.find_date_range().await {
        Ok(Some(range)) => Json(range).into_response(),
        Ok(None) => not_found("no reports stored"),
        Err(err) => server_error(err),
    }
}

async fn record_by_date_handler(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Response {
    lookup(&state, &date).await
}

async fn lookup(state: &AppState, date: &str) -> Response {
    match state.store.find_by_date(date).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(&format!("no report for {date}")),
        Err(err) => server_error(err),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "record store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
