//! POST /api/jobs
//!
//! Thin entry point over [`Dispatcher::request_job`](crate::kernel::jobs::Dispatcher::request_job).

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::kernel::jobs::{JobRequestOutcome, WorkType};
use crate::server::app::AppState;
use crate::server::middleware::ClientIp;

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub url: String,
    pub work_type: WorkType,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// 202 when a new attempt was dispatched, 200 for every other decision.
pub async fn request_job_handler(
    Extension(state): Extension<AppState>,
    client_ip: Option<Extension<ClientIp>>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<JobRequestOutcome>), ApiError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "url required"));
    }

    let caller_ip = client_ip.map(|Extension(ClientIp(ip))| ip.to_string());
    let outcome = state
        .dispatcher
        .request_job(url, request.work_type, caller_ip)
        .await
        .map_err(|e| {
            error!(url, work_type = %request.work_type, error = %e, "job request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let status = if outcome.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}
