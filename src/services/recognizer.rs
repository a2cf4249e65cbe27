use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::job::JobType;
use crate::models::recognition::{Detection, ModelInput};

/// Object-detection model mapping a preprocessed captcha to labeled boxes.
#[async_trait::async_trait]
pub trait Recognizer: Send + Sync {
    async fn infer(&self, job_type: JobType, input: &ModelInput) -> Result<Vec<Detection>, RecognizerError>;
}

/// Client for an inference server hosting one detector per job type.
pub struct HttpRecognizer {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct InferRequest<'a> {
    shape: [usize; 3],
    data: &'a [f32],
}

#[derive(Deserialize)]
struct InferResponse {
    detections: Vec<Detection>,
}

impl HttpRecognizer {
    pub fn new(base_url: &str) -> Result<Self, RecognizerError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(RecognizerError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Recognizer for HttpRecognizer {
    /// POST the tensor to `{base_url}/infer/{job_type}`.
    async fn infer(&self, job_type: JobType, input: &ModelInput) -> Result<Vec<Detection>, RecognizerError> {
        let url = format!("{}/infer/{}", self.base_url, job_type);

        let response = self
            .http
            .post(&url)
            .json(&InferRequest {
                shape: input.shape,
                data: &input.data,
            })
            .send()
            .await
            .map_err(RecognizerError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecognizerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: InferResponse = response.json().await.map_err(RecognizerError::Http)?;
        Ok(parsed.detections)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecognizerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Recognizer failed: {0}")]
    Model(String),
}
