use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

use super::success_with;
use crate::app::AppState;

/// Liveness check. Outside the key check, and the one route that answers non-200.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.db.ping() {
        Ok(()) => success_with(
            "API is healthy",
            json!({
                "timestamp": Utc::now(),
                "database": "connected",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "database": "disconnected",
                    "message": "Health check failed",
                    "timestamp": Utc::now(),
                })),
            )
                .into_response()
        }
    }
}
