use serde::Deserialize;
use std::time::Duration;

use crate::models::job::JobType;
use crate::services::connect::RetryPolicy;
use crate::services::processor::BlobConsumeMode;
use crate::services::storage::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by workers.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for blobs and task records
    pub redis_url: String,

    /// AMQP connection string, credentials included
    pub amqp_url: String,

    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_exchange_dead_letter")]
    pub exchange_dead_letter: String,

    #[serde(default = "default_fns_queue")]
    pub fns_queue: String,

    #[serde(default = "default_alco_queue")]
    pub alco_queue: String,

    /// Blob time-to-live in seconds; 0 keeps blobs until consumed
    #[serde(default)]
    pub blob_ttl_secs: u64,

    /// Task record time-to-live in seconds; 0 keeps records forever
    #[serde(default)]
    pub task_ttl_secs: u64,

    /// Maximum size of one stored blob chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Detections scoring at or below this are discarded
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Base URL of the inference server. Required by workers.
    pub recognizer_url: Option<String>,

    /// Job type served by a worker process
    pub job_type: Option<JobType>,

    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,

    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default)]
    pub blob_consume_mode: BlobConsumeMode,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_exchange() -> String {
    "exchange".to_string()
}

fn default_exchange_dead_letter() -> String {
    "exchange-dead-letter".to_string()
}

fn default_fns_queue() -> String {
    "fns-queue".to_string()
}

fn default_alco_queue() -> String {
    "alco-queue".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_confidence_threshold() -> f64 {
    0.9
}

fn default_connect_max_attempts() -> u32 {
    10
}

fn default_connect_backoff_ms() -> u64 {
    1000
}

fn ttl(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("CHUNK_SIZE must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }

    pub fn queue_for(&self, job_type: JobType) -> &str {
        match job_type {
            JobType::Fns => &self.fns_queue,
            JobType::Alco => &self.alco_queue,
        }
    }

    pub fn blob_ttl(&self) -> Option<Duration> {
        ttl(self.blob_ttl_secs)
    }

    pub fn task_ttl(&self) -> Option<Duration> {
        ttl(self.task_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_max_attempts,
            backoff: Duration::from_millis(self.connect_backoff_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
