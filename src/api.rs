//! Reporting HTTP API
//!
//! Thin read-only handlers over a [`ReportStore`].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::database;
use crate::error::{Error, Result};
use crate::reports::{
    clamp_limit, ChannelActivityItem, DetectedObjectReportItem, MessageSearchResult, PgReports,
    ProductReportItem, ReportStore, DEFAULT_REPORT_LIMIT, DEFAULT_SEARCH_LIMIT,
};

pub type SharedReports = Arc<dyn ReportStore>;

/// Error body mirrors `{"detail": "..."}`.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Error::ChannelNotFound(_) = &self.0 {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": self.0.to_string() })),
            )
                .into_response();
        }
        error!("Request failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "internal error" })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

pub fn router(store: SharedReports) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/search/messages", get(search_messages))
        .route("/api/reports/top-products", get(top_products))
        .route("/api/channels/:channel_name/activity", get(channel_activity))
        .route("/api/reports/top-detected-objects", get(top_detected_objects))
        .with_state(store)
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "Welcome to the Telegram Analytics API. See /api/... for the available reports."
    }))
}

async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /api/search/messages?query=&limit=
async fn search_messages(
    State(store): State<SharedReports>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<MessageSearchResult>>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_SEARCH_LIMIT);
    Ok(Json(store.search_messages(&params.query, limit).await?))
}

/// GET /api/reports/top-products?limit=
async fn top_products(
    State(store): State<SharedReports>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<ProductReportItem>>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_REPORT_LIMIT);
    Ok(Json(store.top_products(limit).await?))
}

/// GET /api/channels/{channel_name}/activity
async fn channel_activity(
    State(store): State<SharedReports>,
    Path(channel_name): Path<String>,
) -> Result<Json<Vec<ChannelActivityItem>>, ApiError> {
    Ok(Json(store.channel_activity_by_name(&channel_name).await?))
}

/// GET /api/reports/top-detected-objects?limit=
async fn top_detected_objects(
    State(store): State<SharedReports>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<DetectedObjectReportItem>>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_REPORT_LIMIT);
    Ok(Json(store.top_detected_objects(limit).await?))
}

/// Listen on `addr`, e.g. `127.0.0.1:8000`.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| Error::Server {
        addr: addr.to_string(),
        source: e,
    })
}

/// Bind the API and serve until the process is stopped.
pub async fn serve(settings: &Settings) -> Result<()> {
    let pool = database::connect_pool(&settings.db, settings.api_max_connections).await?;
    let store: SharedReports = Arc::new(PgReports::new(pool, &settings.db.warehouse_schema));

    let listener = bind(&settings.api_bind).await?;
    info!("Reporting API listening on {}", settings.api_bind);
    axum::serve(listener, router(store))
        .await
        .map_err(|e| Error::Server {
            addr: settings.api_bind.clone(),
            source: e,
        })
}
