use crate::config::ApiConfig;
use crate::feed::{FeedHandle, FeedSnapshot, FeedState, MirrorHandle};
use crate::records::{Detection, DetectionStats, PersonDetection};
use crate::status::{StatusMirror, StatusSnapshot};
use crate::weather::WeatherView;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub detections: FeedHandle<Detection>,
    pub person_counts: FeedHandle<PersonDetection>,
    pub status: MirrorHandle<StatusMirror>,
    pub weather: watch::Receiver<WeatherView>,
}

/// Query parameters for record lists
#[derive(Debug, Default, Deserialize)]
pub struct RecordListQuery {
    /// Return at most this many of the newest records
    pub limit: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/detections", get(list_detections))
        .route("/api/v1/detections/latest", get(latest_detection))
        .route("/api/v1/detections/stats", get(detection_stats))
        .route("/api/v1/person-counts", get(list_person_counts))
        .route("/api/v1/status", get(system_status))
        .route("/api/v1/weather", get(weather))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "skywatch-feed"
    }))
}

/// Ready once both record feeds have completed an initial fetch
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let detections = state.detections.snapshot();
    let person_counts = state.person_counts.snapshot();

    let ready = detections.state == FeedState::Live && person_counts.state == FeedState::Live;
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
            "feeds": {
                "detections": { "state": detections.state, "stale": detections.stale },
                "person_counts": { "state": person_counts.state, "stale": person_counts.stale },
            }
        })),
    )
}

fn limited<T: Clone>(
    mut snapshot: FeedSnapshot<T>,
    params: &RecordListQuery,
) -> Result<FeedSnapshot<T>, ApiError> {
    match params.limit {
        Some(0) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "limit must be at least 1".to_string(),
                code: "INVALID_LIMIT".to_string(),
            }),
        )),
        Some(limit) if limit < snapshot.records.len() => {
            snapshot.records = snapshot.records[..limit].into();
            Ok(snapshot)
        }
        _ => Ok(snapshot),
    }
}

/// Detections, newest first
#[instrument(skip(state))]
async fn list_detections(
    State(state): State<AppState>,
    Query(params): Query<RecordListQuery>,
) -> Result<Json<FeedSnapshot<Detection>>, ApiError> {
    limited(state.detections.snapshot(), &params).map(Json)
}

async fn latest_detection(State(state): State<AppState>) -> Json<Option<Detection>> {
    Json(state.detections.snapshot().records.first().cloned())
}

async fn detection_stats(State(state): State<AppState>) -> Json<DetectionStats> {
    let snapshot = state.detections.snapshot();
    Json(DetectionStats::compute(&snapshot.records, Utc::now()))
}

/// Person-count samples, newest first
#[instrument(skip(state))]
async fn list_person_counts(
    State(state): State<AppState>,
    Query(params): Query<RecordListQuery>,
) -> Result<Json<FeedSnapshot<PersonDetection>>, ApiError> {
    limited(state.person_counts.snapshot(), &params).map(Json)
}

async fn system_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

async fn weather(State(state): State<AppState>) -> Json<WeatherView> {
    Json(state.weather.borrow().clone())
}

/// Start the dashboard API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting dashboard API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
