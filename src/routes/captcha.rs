use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::{ErrorResponse, SubmitResponse, TaskResponse};
use crate::models::job::JobType;
use crate::services::submit::SubmitError;
use crate::services::tracker::TaskError;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { detail: detail.into() }))
}

/// POST /process_captcha/{captcha_type}: submit a raw image body.
pub async fn submit_captcha(
    State(state): State<AppState>,
    Path(captcha_type): Path<String>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    let job_type: JobType = captcha_type.parse().map_err(|_| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Unknown captcha type '{captcha_type}'"),
        )
    })?;

    match state.captcha.submit(job_type, &body).await {
        Ok(id) => Ok(Json(SubmitResponse { id })),
        Err(SubmitError::InvalidImage(detail)) => {
            Err(api_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, detail))
        }
        Err(e) => {
            tracing::error!(job_type = %job_type, error = %e, "Captcha submission failed");
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

/// GET /result/{task_id}: current status and, once finished, the result.
pub async fn get_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    match state.captcha.poll(&task_id).await {
        Ok(view) => Ok(Json(TaskResponse {
            status: view.message.to_string(),
            result: view.result,
        })),
        Err(e @ TaskError::NotRegistered(_)) => Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Task lookup failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
