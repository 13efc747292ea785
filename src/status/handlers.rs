//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use super::server::AppState;
use crate::config::SourceConfig;
use crate::source::SourceStats;

/// API response wrapper
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Get source statistics
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<SourceStats>>) {
    if state.source.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error("source is closed")),
        );
    }
    (StatusCode::OK, Json(ApiResponse::ok(state.source.stats())))
}

/// Get the applied source configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SourceConfig>> {
    Json(ApiResponse::ok(state.source.config()))
}
