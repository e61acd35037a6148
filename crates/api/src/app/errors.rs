use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use coursegen_infra::jobs::{StoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        SubmitError::Conflict(identity) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("an active job already exists for {identity}"),
        ),
        SubmitError::Unavailable => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "job store temporarily unavailable, retry later",
        ),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    tracing::error!(error = %err, "job store error");
    match err {
        StoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        StoreError::Conflict(identity) => json_error(
            StatusCode::CONFLICT,
            "conflict",
            format!("an active job already exists for {identity}"),
        ),
        _ => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "job store error"),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
