use serde::{Deserialize, Serialize};

use crate::models::task::RecognitionResult;

/// Response after submitting a captcha for recognition.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
}

/// Response for polling a task.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: String,
    pub result: Option<RecognitionResult>,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
