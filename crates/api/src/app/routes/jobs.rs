use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use coursegen_core::JobId;
use coursegen_infra::jobs::SubmitRequest;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:id", get(get_job))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text());
        }
    };

    match services.jobs.submit(request).await {
        Ok(job_id) => (StatusCode::CREATED, Json(dto::SubmitResponse { job_id })).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "job id must be a UUID");
    };

    match services.jobs.get_status(job_id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}
