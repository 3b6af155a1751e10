use axum::{
    Json,
    extract::Extension,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use agentexec_observability::metrics::TEXT_CONTENT_TYPE;

use crate::app::AppState;
use crate::app::errors::json_error;

/// 200 while the job consumer is pulling over an open broker connection, 503 otherwise.
pub async fn health(Extension(state): Extension<AppState>) -> Response {
    if state.probe.is_live() {
        (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        )
            .into_response()
    }
}

pub async fn metrics(Extension(state): Extension<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "metrics_error", e.to_string()),
    }
}
