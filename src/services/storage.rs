use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::services::kv::{KvBackend, KvError, WriteOp};

/// Default upper bound for a single stored chunk (256 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 28;

const REGISTRY_NAME: &str = "RedisStorageRegistry";
const CHUNKS_SUFFIX: &str = "chunks";
const KEY_SEPARATOR: char = '|';

/// Split a payload into chunks of at most `chunk_size` bytes.
///
/// A payload that fits in one chunk (including the empty payload) yields
/// exactly one chunk, so a stored blob always has a non-empty chunk list.
pub fn chunk_bytes(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if data.len() <= chunk_size {
        return vec![data];
    }
    data.chunks(chunk_size).collect()
}

/// Chunked binary object storage over a [`KvBackend`].
///
/// Each blob is an ordered list of chunks under `"{namespace}|{key}|chunks"`
/// plus a field in the per-namespace registry hash. The registry is the
/// source of truth for existence; a registered blob whose chunk list has
/// expired reads as absent.
#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn KvBackend>,
    namespace: String,
    chunk_size: usize,
    ttl: Option<Duration>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            ttl: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Expire chunk lists `ttl` after they are written. `None` keeps blobs
    /// until they are deleted or popped.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    /// A handle on the same backend scoped to another namespace.
    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        let mut store = self.clone();
        store.set_namespace(namespace);
        store
    }

    fn registry_key(&self) -> String {
        format!("{}{KEY_SEPARATOR}{REGISTRY_NAME}", self.namespace)
    }

    fn chunks_key(&self, key: &str) -> String {
        format!("{}{KEY_SEPARATOR}{key}{KEY_SEPARATOR}{CHUNKS_SUFFIX}", self.namespace)
    }

    fn check_key(&self, key: &str) -> Result<(), StorageError> {
        if self.namespace.is_empty() || self.namespace.contains(KEY_SEPARATOR) {
            return Err(StorageError::InvalidArgument(format!(
                "namespace '{}' must be non-empty and must not contain '{KEY_SEPARATOR}'",
                self.namespace
            )));
        }
        if key.is_empty() || key.contains(KEY_SEPARATOR) {
            return Err(StorageError::InvalidArgument(format!(
                "key '{key}' must be non-empty and must not contain '{KEY_SEPARATOR}'"
            )));
        }
        Ok(())
    }

    fn not_found(&self, key: &str) -> StorageError {
        StorageError::NotFound {
            namespace: self.namespace.clone(),
            key: key.to_string(),
        }
    }

    /// Store `data` under `key`, replacing any previous blob.
    ///
    /// The chunk list and the registry entry are written in one atomic batch.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        self.check_key(key)?;
        let chunks_key = self.chunks_key(key);

        let mut ops = vec![WriteOp::Delete {
            key: chunks_key.clone(),
        }];
        ops.extend(
            chunk_bytes(data, self.chunk_size)
                .into_iter()
                .map(|chunk| WriteOp::ListPush {
                    key: chunks_key.clone(),
                    value: chunk.to_vec(),
                }),
        );
        ops.push(WriteOp::HashSet {
            key: self.registry_key(),
            field: key.to_string(),
            value: b"1".to_vec(),
        });
        if let Some(ttl) = self.ttl {
            ops.push(WriteOp::Expire {
                key: chunks_key,
                ttl,
            });
        }

        self.backend.atomic(ops).await?;

        tracing::debug!(
            namespace = %self.namespace,
            key = %key,
            size = data.len(),
            "Stored blob"
        );
        Ok(key.to_string())
    }

    /// Store `data` under a freshly generated key.
    pub async fn put_new(&self, data: &[u8]) -> Result<String, StorageError> {
        self.put(&Uuid::new_v4().to_string(), data).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check_key(key)?;
        if !self.backend.hash_exists(&self.registry_key(), key).await? {
            return Ok(false);
        }
        Ok(self.backend.exists(&self.chunks_key(key)).await?)
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        if !self.exists(key).await? {
            return Err(self.not_found(key));
        }

        let chunks = self.backend.list_range(&self.chunks_key(key)).await?;
        if chunks.is_empty() {
            // Expired between the existence check and the read.
            return Err(self.not_found(key));
        }
        Ok(chunks.concat())
    }

    /// Remove a blob. Fails with `NotFound` if it was not readable, after
    /// clearing any stale registry entry.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let live = self.exists(key).await?;
        self.backend
            .atomic(vec![
                WriteOp::Delete {
                    key: self.chunks_key(key),
                },
                WriteOp::HashDelete {
                    key: self.registry_key(),
                    field: key.to_string(),
                },
            ])
            .await?;

        if !live {
            return Err(self.not_found(key));
        }
        Ok(())
    }

    /// Read and remove a blob in one transaction, so a duplicated message
    /// cannot consume the same payload twice.
    pub async fn pop(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.check_key(key)?;
        let taken = self
            .backend
            .take_list(&self.chunks_key(key), &self.registry_key(), key)
            .await?;

        match taken {
            Some(chunks) if !chunks.is_empty() => Ok(chunks.concat()),
            _ => Err(self.not_found(key)),
        }
    }

    /// Readable keys in this namespace, sorted.
    ///
    /// Registry entries whose chunk list has expired are pruned on the way.
    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let registry = self.registry_key();
        let mut live = Vec::new();
        let mut stale = Vec::new();

        for key in self.backend.hash_keys(&registry).await? {
            if self.backend.exists(&self.chunks_key(&key)).await? {
                live.push(key);
            } else {
                stale.push(WriteOp::HashDelete {
                    key: registry.clone(),
                    field: key,
                });
            }
        }

        if !stale.is_empty() {
            tracing::debug!(
                namespace = %self.namespace,
                pruned = stale.len(),
                "Pruned expired blobs from registry"
            );
            self.backend.atomic(stale).await?;
        }

        live.sort();
        Ok(live)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No blob '{key}' in namespace '{namespace}'")]
    NotFound { namespace: String, key: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage backend error: {0}")]
    Backend(#[from] KvError),
}
