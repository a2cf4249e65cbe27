use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Status of a recognition task.
///
/// Transitions only move forward: `received -> processing -> finished`, or
/// into `failed` from `received`/`processing`. A failed task is never
/// resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Received,
    Processing,
    Finished,
    Failed,
}

impl TaskStatus {
    /// Whether a task in this status may be moved to `next`.
    ///
    /// Re-applying the current status is allowed so that a redelivered
    /// message can mark its task `processing` again.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        self == next
            || matches!(
                (self, next),
                (Received, Processing) | (Received, Failed) | (Processing, Finished) | (Processing, Failed)
            )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }

    /// Human-readable status shown to pollers.
    pub fn message(self) -> &'static str {
        match self {
            TaskStatus::Received => "Waiting for processing",
            TaskStatus::Processing => "In processing",
            TaskStatus::Finished => "Processed",
            TaskStatus::Failed => "Processing failed",
        }
    }
}

/// Recognized CAPTCHA text and the product of its per-character confidences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RecognitionResult {
    #[garde(skip)]
    pub text: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

impl RecognitionResult {
    /// True when no detection survived thresholding. Such a result carries
    /// confidence 1.0 (the empty product) and must not be read as a
    /// high-confidence recognition.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// A recognition task as persisted by the task tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub result: Option<RecognitionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// New task with a random identifier in the `received` status.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: TaskStatus::Received,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}
