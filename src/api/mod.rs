//! API layer -- axum routes, handlers, and middleware.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use self::state::AppState;
use crate::pipeline::SubmitError;
use crate::quota::QuotaExceeded;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    let artifacts = ServeDir::new(&state.artifacts_root);
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .nest_service("/artifacts", artifacts)
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler error, rendered as `{"error": {...}}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Invalid(String),
    Quota(QuotaExceeded),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({ "code": "not_found", "message": format!("{what} not found") }),
            ),
            ApiError::Invalid(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "code": "invalid", "message": message }),
            ),
            ApiError::Quota(q) => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "code": "quota_exceeded",
                    "message": q.to_string(),
                    "subject": q.subject,
                    "current": q.current,
                    "limit": q.limit,
                    "percentage": q.percentage,
                }),
            ),
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "code": "internal", "message": "internal error" }),
                )
            }
        };
        (status, Json(json!({ "error": body }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Quota(q) => ApiError::Quota(q),
            SubmitError::Invalid(e) => ApiError::Invalid(e.to_string()),
            SubmitError::Storage(e) => ApiError::Internal(e),
        }
    }
}
