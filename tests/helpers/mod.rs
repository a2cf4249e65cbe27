//! Shared helpers for the pipeline, integration and end-to-end tests.

#![allow(dead_code)]

use capts::models::api::{SubmitResponse, TaskResponse};
use capts::models::job::JobType;
use capts::models::recognition::{Detection, ModelInput};
use capts::services::kv::{KvBackend, MemoryBackend};
use capts::services::pipeline::pipeline_for;
use capts::services::processor::Processor;
use capts::services::queue::{Broker, MemoryBroker, Topology};
use capts::services::recognizer::{Recognizer, RecognizerError};
use capts::services::storage::BlobStore;
use capts::services::submit::CaptchaService;
use capts::services::tracker::TaskTracker;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Encode a solid PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .expect("PNG encoding failed");
    buf.into_inner()
}

/// A PNG with the dimensions `job_type` expects.
pub fn captcha_png(job_type: JobType) -> Vec<u8> {
    let (height, width) = job_type.image_dimensions();
    png(width, height)
}

/// Recognizer returning a fixed set of detections.
pub struct StubRecognizer {
    pub detections: Vec<Detection>,
}

#[async_trait::async_trait]
impl Recognizer for StubRecognizer {
    async fn infer(&self, _: JobType, _: &ModelInput) -> Result<Vec<Detection>, RecognizerError> {
        Ok(self.detections.clone())
    }
}

/// Recognizer that always fails.
pub struct FailingRecognizer;

#[async_trait::async_trait]
impl Recognizer for FailingRecognizer {
    async fn infer(&self, _: JobType, _: &ModelInput) -> Result<Vec<Detection>, RecognizerError> {
        Err(RecognizerError::Model("model not loaded".to_string()))
    }
}

/// Detections spelling "ABC", listed out of reading order.
pub fn abc_detections() -> Vec<Detection> {
    vec![
        Detection::new("C", [50.0, 5.0, 62.0, 40.0], 0.95),
        Detection::new("A", [10.0, 5.0, 22.0, 40.0], 0.99),
        Detection::new("B", [30.0, 5.0, 42.0, 40.0], 0.98),
    ]
}

pub fn topology() -> Topology {
    Topology::new("exchange", "exchange-dead-letter")
        .bind("fns-queue", "fns")
        .bind("alco-queue", "alco")
}

/// Producer and worker sharing one in-memory store and broker.
pub struct Stack {
    pub kv: Arc<dyn KvBackend>,
    pub broker: MemoryBroker,
    pub blobs: BlobStore,
    pub tracker: TaskTracker,
    pub service: CaptchaService,
}

impl Stack {
    pub async fn new(chunk_size: usize) -> Self {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let broker = MemoryBroker::new();
        let topology = topology();
        broker
            .declare_topology(&topology)
            .await
            .expect("topology declaration failed");

        let blobs = BlobStore::new(Arc::clone(&kv), "default").with_chunk_size(chunk_size);
        let tracker = TaskTracker::new(Arc::clone(&kv));
        let service = CaptchaService::new(
            blobs.clone(),
            tracker.clone(),
            Arc::new(broker.clone()),
            &topology,
        );

        Self {
            kv,
            broker,
            blobs,
            tracker,
            service,
        }
    }

    pub fn processor(&self, job_type: JobType, recognizer: Arc<dyn Recognizer>) -> Processor {
        Processor::new(
            pipeline_for(job_type, 0.9),
            recognizer,
            self.blobs.with_namespace(job_type.namespace()),
            self.tracker.clone(),
        )
    }

    /// Drain `queue` through `processor`.
    pub async fn drain(&self, processor: &Processor, queue: &str) {
        let source = self.broker.consume(queue).await.expect("consume failed");
        processor.run(source).await.expect("consume loop failed");
    }
}

/// Base URL of a running server, from `API_BASE_URL`.
pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:8000".to_string())
}

/// POST an image to /process_captcha/{captcha_type}.
pub async fn submit_captcha(
    client: &reqwest::Client,
    base_url: &str,
    captcha_type: &str,
    image: Vec<u8>,
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/process_captcha/{}", base_url, captcha_type))
        .header("content-type", "application/octet-stream")
        .body(image)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Submit failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<SubmitResponse>().await?)
}

/// Poll /result/{task_id} until the task is processed or failed.
pub async fn poll_result(
    client: &reqwest::Client,
    base_url: &str,
    task_id: &str,
    timeout_secs: u64,
) -> Result<TaskResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for _ in 0..max_attempts {
        let response = client
            .get(format!("{}/result/{}", base_url, task_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let task = response.json::<TaskResponse>().await?;
        match task.status.as_str() {
            "Processed" | "Processing failed" => return Ok(task),
            _ => sleep(Duration::from_millis(500)).await,
        }
    }

    Err(format!("Task did not complete within {} seconds", timeout_secs).into())
}
