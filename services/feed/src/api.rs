use crate::cache::{CacheStatus, SnapshotCache};
use crate::config::ApiConfig;
use crate::snapshot::Item;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const LANDING_PAGE: &str = include_str!("../static/root.html");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SnapshotCache>,
    /// Upper bound on items returned by `/latest_videos`
    pub max_items: usize,
}

/// One video in the `/latest_videos` response
#[derive(Debug, Serialize)]
pub struct VideoResponse<'a> {
    #[serde(rename = "Url")]
    pub url: &'a str,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

impl<'a> From<&'a Item> for VideoResponse<'a> {
    fn from(item: &'a Item) -> Self {
        Self {
            url: item.location(),
            time: item.observed_at(),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Request handling errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to serialize response: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self, "Request failed");

        let (status, code) = match self {
            ApiError::SerializationFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let routes = Router::new()
        .route("/", get(landing_page))
        .route("/latest_videos", get(latest_videos))
        .route("/latest_videos/", get(latest_videos_redirect))
        .route("/health", get(health_check))
        .route("/status", get(cache_status));

    with_middleware(routes, config).with_state(state)
}

/// Request timeout, tracing, CORS and compression
fn with_middleware<S>(router: Router<S>, config: &ApiConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
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

    let router = router
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    if config.compression {
        router.layer(CompressionLayer::new())
    } else {
        router
    }
}

/// Static landing page
async fn landing_page() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

/// Newest videos from the current snapshot
async fn latest_videos(State(state): State<AppState>) -> Result<Response, ApiError> {
    metrics::counter!("feed.api.requests", "endpoint" => "latest_videos").increment(1);

    let snapshot = state.cache.read();
    let videos: Vec<VideoResponse<'_>> = snapshot
        .latest(state.max_items)
        .iter()
        .map(VideoResponse::from)
        .collect();

    // Encode up front so a failure never produces a partial body
    let body = serde_json::to_vec(&videos)?;

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Trailing slash form of `/latest_videos`
async fn latest_videos_redirect() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/latest_videos")],
    )
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "camjam-feed"
    }))
}

/// Refresh diagnostics
async fn cache_status(State(state): State<AppState>) -> Json<CacheStatus> {
    Json(state.cache.status())
}

/// Start the API server, stopping gracefully once `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.listen_addr()?;
    let router = create_router(state, config);

    info!(address = %addr, "Starting video API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
