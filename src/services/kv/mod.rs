//! Key-value backend used by the blob store and the task tracker.
//!
//! The surface is deliberately small: scalar set/get, list range, hash
//! membership, and atomic write batches. Anything richer is built on top in
//! [`crate::services::storage`] and [`crate::services::tracker`].

mod memory;
mod redis;

use std::time::Duration;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Delete { key: String },
    ListPush { key: String, value: Vec<u8> },
    HashSet { key: String, field: String, value: Vec<u8> },
    HashDelete { key: String, field: String },
    Expire { key: String, ttl: Duration },
}

#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    /// Set a scalar value, replacing whatever was stored under `key`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// Every element of the list at `key`, in push order. Missing keys read
    /// as an empty list.
    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError>;

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool, KvError>;

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// Apply all writes as one transaction.
    async fn atomic(&self, ops: Vec<WriteOp>) -> Result<(), KvError>;

    /// In one transaction: read the list at `key`, delete it, and remove
    /// `field` from the hash at `registry`.
    ///
    /// Returns `None` if `field` was not present in `registry`.
    async fn take_list(
        &self,
        key: &str,
        registry: &str,
        field: &str,
    ) -> Result<Option<Vec<Vec<u8>>>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
}
