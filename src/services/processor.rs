//! Generic consume loop: message -> payload -> recognizer -> task result.
//!
//! Every stage returns a typed error. [`Processor::settle`] turns the outcome
//! into exactly one broker action: ack on success, reject without requeue
//! (dead-lettering the message) on any failure, marking the task `failed`
//! whenever its id can be trusted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::models::message::{Message, MessageError};
use crate::models::task::{RecognitionResult, TaskStatus};
use crate::services::pipeline::{CaptchaPipeline, PreprocessError};
use crate::services::queue::{Delivery, MessageSource, QueueError};
use crate::services::recognizer::{Recognizer, RecognizerError};
use crate::services::storage::{BlobStore, StorageError};
use crate::services::tracker::{TaskError, TaskTracker};

/// How a worker reads a task's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobConsumeMode {
    /// Read and remove in one transaction. A redelivered message finds no
    /// payload and fails instead of being recognized twice.
    #[default]
    Pop,
    /// Read only; the payload stays until its TTL runs out.
    Get,
}

/// Broker action taken for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] MessageError),

    #[error("Image with key {task_id} not found in namespace {namespace}")]
    MissingPayload { task_id: String, namespace: String },

    #[error("Storage error for task {task_id}: {source}")]
    Storage { task_id: String, source: StorageError },

    #[error("Preprocessing failed for task {task_id}: {source}")]
    Preprocess { task_id: String, source: PreprocessError },

    #[error("Recognition failed for task {task_id}: {source}")]
    Recognizer { task_id: String, source: RecognizerError },

    #[error("Task tracker error for task {task_id}: {source}")]
    Tracker { task_id: String, source: TaskError },
}

impl ProcessError {
    /// Id of the task the failing message referred to, if it could be decoded.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ProcessError::Malformed(_) => None,
            ProcessError::MissingPayload { task_id, .. }
            | ProcessError::Storage { task_id, .. }
            | ProcessError::Preprocess { task_id, .. }
            | ProcessError::Recognizer { task_id, .. }
            | ProcessError::Tracker { task_id, .. } => Some(task_id),
        }
    }

    /// Whether the failure should be recorded on the task as `failed`.
    pub fn marks_task_failed(&self) -> bool {
        match self {
            ProcessError::Malformed(_) => false,
            ProcessError::Tracker {
                source: TaskError::NotRegistered(_),
                ..
            } => false,
            ProcessError::MissingPayload { .. }
            | ProcessError::Storage { .. }
            | ProcessError::Preprocess { .. }
            | ProcessError::Recognizer { .. }
            | ProcessError::Tracker { .. } => true,
        }
    }

    /// Every failure is terminal for its message.
    pub fn disposition(&self) -> Disposition {
        Disposition::Reject
    }
}

/// Runs one job type's pipeline against deliveries from its queue.
pub struct Processor {
    pipeline: Arc<dyn CaptchaPipeline>,
    recognizer: Arc<dyn Recognizer>,
    blobs: BlobStore,
    tracker: TaskTracker,
    consume_mode: BlobConsumeMode,
}

impl Processor {
    pub fn new(
        pipeline: Arc<dyn CaptchaPipeline>,
        recognizer: Arc<dyn Recognizer>,
        blobs: BlobStore,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            pipeline,
            recognizer,
            blobs,
            tracker,
            consume_mode: BlobConsumeMode::default(),
        }
    }

    pub fn with_consume_mode(mut self, consume_mode: BlobConsumeMode) -> Self {
        self.consume_mode = consume_mode;
        self
    }

    /// Run the full pipeline for one message body and persist its result.
    pub async fn handle(&self, body: &[u8]) -> Result<RecognitionResult, ProcessError> {
        let message = Message::parse(body)?;
        let task_id = message.task_id.as_str();
        let tracker_error = |source: TaskError| ProcessError::Tracker {
            task_id: task_id.to_string(),
            source,
        };

        self.tracker
            .update_status(task_id, TaskStatus::Processing)
            .await
            .map_err(tracker_error)?;

        let image = self.load_payload(&message).await?;

        let input = self
            .pipeline
            .preprocess(&image)
            .map_err(|source| ProcessError::Preprocess {
                task_id: task_id.to_string(),
                source,
            })?;

        let inference_started = Instant::now();
        let detections = self
            .recognizer
            .infer(self.pipeline.job_type(), &input)
            .await
            .map_err(|source| ProcessError::Recognizer {
                task_id: task_id.to_string(),
                source,
            })?;
        tracing::debug!(
            task_id = %task_id,
            detections = detections.len(),
            inference_ms = inference_started.elapsed().as_millis() as u64,
            "Recognizer returned"
        );

        let result = self.pipeline.postprocess(detections);

        self.tracker
            .publish_result(task_id, result.clone())
            .await
            .map_err(tracker_error)?;
        self.tracker
            .update_status(task_id, TaskStatus::Finished)
            .await
            .map_err(tracker_error)?;

        Ok(result)
    }

    async fn load_payload(&self, message: &Message) -> Result<Vec<u8>, ProcessError> {
        let blobs = self.blobs.with_namespace(&message.storage_namespace);
        let loaded = match self.consume_mode {
            BlobConsumeMode::Pop => blobs.pop(&message.task_id).await,
            BlobConsumeMode::Get => blobs.get(&message.task_id).await,
        };

        loaded.map_err(|e| match e {
            StorageError::NotFound { namespace, key } => ProcessError::MissingPayload {
                task_id: key,
                namespace,
            },
            source => ProcessError::Storage {
                task_id: message.task_id.clone(),
                source,
            },
        })
    }

    /// Acknowledge or reject `delivery` according to `outcome`.
    ///
    /// Per-message failures end here. Only broker errors while acking or
    /// rejecting are returned.
    pub async fn settle(
        &self,
        source: &mut dyn MessageSource,
        delivery: &Delivery,
        outcome: Result<RecognitionResult, ProcessError>,
    ) -> Result<Disposition, QueueError> {
        let job_type = self.pipeline.job_type().routing_key();

        let error = match outcome {
            Ok(result) => {
                source.ack(delivery.delivery_tag).await?;
                metrics::counter!("captcha_tasks_finished_total", "job_type" => job_type).increment(1);
                tracing::info!(
                    delivery_tag = delivery.delivery_tag,
                    job_type = %job_type,
                    text = %result.text,
                    confidence = result.confidence,
                    empty = result.is_empty(),
                    "Captcha processed"
                );
                return Ok(Disposition::Ack);
            }
            Err(error) => error,
        };

        tracing::error!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            job_type = %job_type,
            task_id = error.task_id().unwrap_or("<unknown>"),
            error = %error,
            "Message processing failed, dead-lettering"
        );

        // Marked before rejecting so the task never depends on the channel
        if let (true, Some(task_id)) = (error.marks_task_failed(), error.task_id()) {
            match self.tracker.update_status(task_id, TaskStatus::Failed).await {
                Ok(_) => {
                    metrics::counter!("captcha_tasks_failed_total", "job_type" => job_type).increment(1);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Could not mark task failed");
                }
            }
        }

        let disposition = error.disposition();
        source.reject(delivery.delivery_tag).await?;
        metrics::counter!("captcha_messages_dead_lettered_total", "job_type" => job_type).increment(1);

        Ok(disposition)
    }

    /// Handle one delivery end to end.
    pub async fn process_delivery(
        &self,
        source: &mut dyn MessageSource,
        delivery: &Delivery,
    ) -> Result<Disposition, QueueError> {
        let started = Instant::now();
        let outcome = self.handle(&delivery.body).await;
        metrics::histogram!(
            "captcha_processing_seconds",
            "job_type" => self.pipeline.job_type().routing_key()
        )
        .record(started.elapsed().as_secs_f64());

        self.settle(source, delivery, outcome).await
    }

    /// Consume deliveries one at a time until the source closes.
    pub async fn run(&self, mut source: Box<dyn MessageSource>) -> Result<(), QueueError> {
        while let Some(delivery) = source.next_delivery().await {
            let delivery = delivery?;
            self.process_delivery(source.as_mut(), &delivery).await?;
        }
        tracing::info!(job_type = %self.pipeline.job_type(), "Message source closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobType;
    use crate::models::recognition::{Detection, ModelInput};
    use crate::models::task::Task;
    use crate::services::kv::MemoryBackend;
    use crate::services::pipeline::FnsPipeline;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct FixedRecognizer(Vec<Detection>);

    #[async_trait::async_trait]
    impl Recognizer for FixedRecognizer {
        async fn infer(&self, _: JobType, _: &ModelInput) -> Result<Vec<Detection>, RecognizerError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenRecognizer;

    #[async_trait::async_trait]
    impl Recognizer for BrokenRecognizer {
        async fn infer(&self, _: JobType, _: &ModelInput) -> Result<Vec<Detection>, RecognizerError> {
            Err(RecognizerError::Model("out of memory".to_string()))
        }
    }

    fn fns_png() -> Vec<u8> {
        let image = RgbImage::from_pixel(200, 100, Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn stack(recognizer: Arc<dyn Recognizer>) -> (Processor, BlobStore, TaskTracker) {
        let backend = Arc::new(MemoryBackend::new());
        let blobs = BlobStore::new(backend.clone(), "fns");
        let tracker = TaskTracker::new(backend);
        let processor = Processor::new(
            Arc::new(FnsPipeline::default()),
            recognizer,
            blobs.clone(),
            tracker.clone(),
        );
        (processor, blobs, tracker)
    }

    async fn submitted(blobs: &BlobStore, tracker: &TaskTracker) -> (Task, Vec<u8>) {
        let task = Task::new();
        blobs.put(&task.id, &fns_png()).await.unwrap();
        tracker.register_task(&task).await.unwrap();
        let body = Message::new(task.id.clone(), "fns").to_bytes().unwrap();
        (task, body)
    }

    #[tokio::test]
    async fn successful_handle_finishes_task_and_pops_payload() {
        let detections = vec![
            Detection::new("2", [40.0, 0.0, 50.0, 20.0], 0.99),
            Detection::new("1", [10.0, 0.0, 20.0, 20.0], 0.98),
        ];
        let (processor, blobs, tracker) = stack(Arc::new(FixedRecognizer(detections)));
        let (task, body) = submitted(&blobs, &tracker).await;

        let result = processor.handle(&body).await.unwrap();
        assert_eq!(result.text, "12");

        let stored = tracker.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Finished);
        assert_eq!(stored.result, Some(result));
        assert!(!blobs.exists(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn get_mode_leaves_payload_in_place() {
        let (processor, blobs, tracker) = stack(Arc::new(FixedRecognizer(Vec::new())));
        let processor = processor.with_consume_mode(BlobConsumeMode::Get);
        let (task, body) = submitted(&blobs, &tracker).await;

        processor.handle(&body).await.unwrap();
        assert!(blobs.exists(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_payload_is_reported() {
        let (processor, blobs, tracker) = stack(Arc::new(FixedRecognizer(Vec::new())));
        let (task, body) = submitted(&blobs, &tracker).await;
        blobs.delete(&task.id).await.unwrap();

        let err = processor.handle(&body).await.unwrap_err();
        assert!(matches!(err, ProcessError::MissingPayload { .. }));
        assert_eq!(err.task_id(), Some(task.id.as_str()));
        assert!(err.marks_task_failed());
    }

    #[tokio::test]
    async fn recognizer_failure_is_reported() {
        let (processor, blobs, tracker) = stack(Arc::new(BrokenRecognizer));
        let (_, body) = submitted(&blobs, &tracker).await;

        let err = processor.handle(&body).await.unwrap_err();
        assert!(matches!(err, ProcessError::Recognizer { .. }));
        assert!(err.marks_task_failed());
        assert_eq!(err.disposition(), Disposition::Reject);
    }

    #[tokio::test]
    async fn malformed_message_does_not_touch_tasks() {
        let (processor, _, _) = stack(Arc::new(FixedRecognizer(Vec::new())));
        let err = processor.handle(b"{\"task\": 1}").await.unwrap_err();
        assert!(matches!(err, ProcessError::Malformed(_)));
        assert_eq!(err.task_id(), None);
        assert!(!err.marks_task_failed());
    }

    /// Source whose broker channel has gone away.
    struct ClosedChannelSource;

    #[async_trait::async_trait]
    impl MessageSource for ClosedChannelSource {
        async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
            None
        }

        async fn ack(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
            Err(QueueError::UnknownDelivery(delivery_tag))
        }

        async fn reject(&mut self, delivery_tag: u64) -> Result<(), QueueError> {
            Err(QueueError::UnknownDelivery(delivery_tag))
        }
    }

    #[tokio::test]
    async fn task_is_marked_failed_even_when_reject_fails() {
        let (processor, blobs, tracker) = stack(Arc::new(BrokenRecognizer));
        let (task, body) = submitted(&blobs, &tracker).await;
        let delivery = Delivery {
            delivery_tag: 7,
            body: body.clone(),
            redelivered: false,
        };

        let outcome = processor.handle(&body).await;
        let settled = processor
            .settle(&mut ClosedChannelSource, &delivery, outcome)
            .await;

        assert!(matches!(settled, Err(QueueError::UnknownDelivery(7))));
        assert_eq!(tracker.get_status(&task.id).await.unwrap(), TaskStatus::Failed);
    }

    struct DroppedConsumer;

    #[async_trait::async_trait]
    impl MessageSource for DroppedConsumer {
        async fn next_delivery(&mut self) -> Option<Result<Delivery, QueueError>> {
            Some(Err(QueueError::UnknownQueue("fns-queue".to_string())))
        }

        async fn ack(&mut self, _: u64) -> Result<(), QueueError> {
            Ok(())
        }

        async fn reject(&mut self, _: u64) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_stops_on_broker_error() {
        let (processor, _, _) = stack(Arc::new(FixedRecognizer(Vec::new())));
        let result = processor.run(Box::new(DroppedConsumer)).await;
        assert!(matches!(result, Err(QueueError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn unregistered_task_is_not_marked_failed() {
        let (processor, _, _) = stack(Arc::new(FixedRecognizer(Vec::new())));
        let body = Message::new("ghost", "fns").to_bytes().unwrap();

        let err = processor.handle(&body).await.unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Tracker { source: TaskError::NotRegistered(_), .. }
        ));
        assert!(!err.marks_task_failed());
    }
}
