use chrono::Utc;
use garde::Validate;
use std::sync::Arc;
use std::time::Duration;

use crate::models::task::{RecognitionResult, Task, TaskStatus};
use crate::services::kv::{KvBackend, KvError};

/// Persists task records as JSON values keyed by task id.
///
/// Updates are read-modify-write without a transaction: concurrent updates
/// to one task (possible only under message redelivery) resolve as
/// last-write-wins.
#[derive(Clone)]
pub struct TaskTracker {
    backend: Arc<dyn KvBackend>,
    ttl: Option<Duration>,
}

impl TaskTracker {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend, ttl: None }
    }

    /// Let task records expire `ttl` after their last write.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Write a brand-new task record. An existing record with the same id is
    /// overwritten.
    pub async fn register_task(&self, task: &Task) -> Result<(), TaskError> {
        self.push(task).await?;
        tracing::debug!(task_id = %task.id, status = %task.status, "Registered task");
        Ok(())
    }

    /// Move a task to `status`, keeping its result.
    ///
    /// A move the status machine does not allow is refused and leaves the
    /// stored record untouched.
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task, TaskError> {
        let mut task = self.get_task(id).await?;
        if !task.status.can_advance_to(status) {
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: status,
            });
        }

        task.status = status;
        task.updated_at = Utc::now();
        self.push(&task).await?;

        tracing::debug!(task_id = %id, status = %status, "Updated task status");
        Ok(task)
    }

    /// Store the recognition result without touching the status.
    pub async fn publish_result(
        &self,
        id: &str,
        result: RecognitionResult,
    ) -> Result<Task, TaskError> {
        result
            .validate()
            .map_err(|report| TaskError::InvalidResult(report.to_string()))?;

        let mut task = self.get_task(id).await?;
        task.result = Some(result);
        task.updated_at = Utc::now();
        self.push(&task).await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, TaskError> {
        let raw = self
            .backend
            .get(id)
            .await?
            .ok_or_else(|| TaskError::NotRegistered(id.to_string()))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn get_status(&self, id: &str) -> Result<TaskStatus, TaskError> {
        Ok(self.get_task(id).await?.status)
    }

    async fn push(&self, task: &Task) -> Result<(), TaskError> {
        let payload = serde_json::to_vec(task)?;
        self.backend.set(&task.id, payload, self.ttl).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Missing task with id {0}")]
    NotRegistered(String),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid recognition result: {0}")]
    InvalidResult(String),

    #[error("Task record serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Task store error: {0}")]
    Backend(#[from] KvError),
}
