use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::dto::HealthResponse;
use crate::app::services::{AppServices, DEGRADED_RATIO};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let jobs = match services.jobs.store().stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "could not count jobs for health check");
            None
        }
    };

    let degraded = services.guard().counter().is_degraded(DEGRADED_RATIO);
    let body = HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        store: services.guard().health(),
        breakers: services.breakers.snapshot(),
        jobs,
    };

    (StatusCode::OK, Json(body)).into_response()
}
