//! HTTP surface for the flow engine.
//!
//! This module provides an HTTP server that:
//! - Serves the live flow status polled by the display page
//! - Serves the usage log and baseline table as JSON or CSV
//! - Reads and saves the flow settings
//!
//! # Architecture
//!
//! ```text
//! browser ──→ GET /flow-data ──→ FlowEngine::status()
//!         ──→ POST /flow-settings ──→ settings file ──→ reload
//! ```

use crate::engine::{FlowEngine, FlowStatus, RuntimeInfo};
use crate::settings::FlowSettings;
use crate::store::{HistoricalRate, LogEntry};
use axum::{
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

type SharedEngine = Arc<FlowEngine>;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Settings page data
#[derive(Serialize)]
pub struct SettingsResponse {
    pub settings: FlowSettings,
    pub runtime: RuntimeInfo,
    pub baselines: BTreeMap<usize, HistoricalRate>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(code: &str, error: impl std::fmt::Display) -> ApiError {
    tracing::error!("{}: {}", code, error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn csv_response(body: String, filename: &str) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /flow-data
async fn flow_data(State(engine): State<SharedEngine>) -> Json<FlowStatus> {
    Json(engine.status())
}

/// GET /flow-log
async fn flow_log(State(engine): State<SharedEngine>) -> Json<Vec<LogEntry>> {
    Json(engine.log_entries())
}

/// GET /flow-log.csv
async fn flow_log_csv(State(engine): State<SharedEngine>) -> Result<impl IntoResponse, ApiError> {
    let body = engine
        .export_log_csv()
        .map_err(|e| internal_error("EXPORT_ERROR", e))?;
    Ok(csv_response(body, "flowlog.csv"))
}

/// GET /flow-rates.csv
async fn flow_rates_csv(
    State(engine): State<SharedEngine>,
) -> Result<impl IntoResponse, ApiError> {
    let body = engine
        .export_rates_csv()
        .map_err(|e| internal_error("EXPORT_ERROR", e))?;
    Ok(csv_response(body, "flowrates.csv"))
}

/// POST /flow-log/clear
async fn clear_log(State(engine): State<SharedEngine>) -> Result<StatusCode, ApiError> {
    engine
        .clear_log()
        .map_err(|e| internal_error("LOG_ERROR", e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /flow-settings
async fn get_settings(State(engine): State<SharedEngine>) -> Json<SettingsResponse> {
    Json(SettingsResponse {
        settings: engine.settings().as_ref().clone(),
        runtime: engine.runtime_info(),
        baselines: engine.baseline_rates(),
    })
}

/// POST /flow-settings
///
/// Accepts the settings form as a JSON object. Invalid fields fall back to
/// their defaults, as they do when the settings file is loaded.
async fn save_settings(
    State(engine): State<SharedEngine>,
    Json(form): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<FlowSettings>, ApiError> {
    let settings = FlowSettings::from_map(&form);
    let saved = engine
        .save_settings(&settings)
        .map_err(|e| internal_error("SETTINGS_ERROR", e))?;
    Ok(Json(saved.as_ref().clone()))
}

/// Build the router for `engine`.
///
/// `/flow-data` answers any origin so display pages served elsewhere on
/// the network can poll it. Everything else is limited to localhost.
pub fn router(engine: SharedEngine) -> Router {
    let feed = Router::new()
        .route("/flow-data", get(flow_data))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        );

    Router::new()
        .route("/health", get(health))
        .route("/flow-log", get(flow_log))
        .route("/flow-log.csv", get(flow_log_csv))
        .route("/flow-rates.csv", get(flow_rates_csv))
        .route("/flow-log/clear", post(clear_log))
        .route("/flow-settings", get(get_settings).post(save_settings))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .merge(feed)
        .with_state(engine)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    engine: SharedEngine,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(engine);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Flow monitor server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
