use garde::Validate;
use serde::{Deserialize, Serialize};

/// Broker message telling a worker which payload to recognize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Message {
    #[garde(length(min = 1, max = 256))]
    pub task_id: String,

    #[garde(length(min = 1, max = 64))]
    pub storage_namespace: String,
}

impl Message {
    pub fn new(task_id: impl Into<String>, storage_namespace: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            storage_namespace: storage_namespace.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Json)
    }

    /// Decode and validate a message body.
    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        let message: Message = serde_json::from_slice(body)?;
        message
            .validate()
            .map_err(|report| MessageError::Invalid(report.to_string()))?;
        Ok(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    Invalid(String),
}
