//! Producer side: accept an image, persist it, and enqueue it for a worker.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::job::JobType;
use crate::models::message::Message;
use crate::models::task::{RecognitionResult, Task, TaskStatus};
use crate::services::queue::{Broker, MessagePublisher, QueueError, Topology};
use crate::services::storage::{BlobStore, StorageError};
use crate::services::tracker::{TaskError, TaskTracker};

/// What a poller sees of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskView {
    pub id: String,
    pub status: TaskStatus,
    pub message: &'static str,
    pub result: Option<RecognitionResult>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            message: task.status.message(),
            status: task.status,
            result: task.result,
            id: task.id,
        }
    }
}

#[derive(Clone)]
pub struct CaptchaService {
    blobs: BlobStore,
    tracker: TaskTracker,
    publishers: HashMap<JobType, MessagePublisher>,
}

impl CaptchaService {
    /// `blobs` supplies backend, chunk size and TTL; its namespace is
    /// replaced per job type on submit.
    pub fn new(blobs: BlobStore, tracker: TaskTracker, broker: Arc<dyn Broker>, topology: &Topology) -> Self {
        let publishers = JobType::ALL
            .into_iter()
            .map(|job_type| {
                let publisher = MessagePublisher::new(
                    Arc::clone(&broker),
                    &topology.exchange,
                    job_type.routing_key(),
                );
                (job_type, publisher)
            })
            .collect();

        Self {
            blobs,
            tracker,
            publishers,
        }
    }

    /// Store `image`, register a `received` task and enqueue it.
    ///
    /// Returns the new task id. The image is only sniffed for a known
    /// format here; size checks happen in the worker's preprocessing.
    pub async fn submit(&self, job_type: JobType, image: &[u8]) -> Result<String, SubmitError> {
        let format = image::guess_format(image).map_err(|e| SubmitError::InvalidImage(e.to_string()))?;

        let task = Task::new();
        let namespace = job_type.namespace();

        self.blobs
            .with_namespace(namespace)
            .put(&task.id, image)
            .await?;
        self.tracker.register_task(&task).await?;

        let publisher = self
            .publishers
            .get(&job_type)
            .ok_or(SubmitError::NoRoute(job_type))?;
        publisher
            .publish_message(&Message::new(task.id.clone(), namespace))
            .await?;

        metrics::counter!("captcha_tasks_submitted_total", "job_type" => job_type.routing_key())
            .increment(1);
        tracing::info!(
            task_id = %task.id,
            job_type = %job_type,
            format = ?format,
            bytes = image.len(),
            "Captcha submitted"
        );

        Ok(task.id)
    }

    pub async fn poll(&self, task_id: &str) -> Result<TaskView, TaskError> {
        Ok(self.tracker.get_task(task_id).await?.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Unsupported or corrupt image: {0}")]
    InvalidImage(String),

    #[error("No queue bound for job type {0}")]
    NoRoute(JobType),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task tracker error: {0}")]
    Tracker(#[from] TaskError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
