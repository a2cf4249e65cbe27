use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{KvBackend, KvError, WriteOp};

#[derive(Debug, Clone)]
enum Value {
    Scalar(Vec<u8>),
    List(Vec<Vec<u8>>),
    Hash(BTreeMap<String, Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

/// In-process key-value store with Redis-like semantics, including
/// per-key expiry. Used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sweep(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
}

fn wrong_type(key: &str) -> KvError {
    KvError::WrongType(key.to_string())
}

fn op_key(op: &WriteOp) -> &str {
    match op {
        WriteOp::Delete { key }
        | WriteOp::ListPush { key, .. }
        | WriteOp::HashSet { key, .. }
        | WriteOp::HashDelete { key, .. }
        | WriteOp::Expire { key, .. } => key,
    }
}

fn apply(entries: &mut HashMap<String, Entry>, op: WriteOp) -> Result<(), KvError> {
    match op {
        WriteOp::Delete { key } => {
            entries.remove(&key);
        }
        WriteOp::ListPush { key, value } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(Value::List(Vec::new())));
            match &mut entry.value {
                Value::List(items) => items.push(value),
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::HashSet { key, field, value } => {
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(Value::Hash(BTreeMap::new())));
            match &mut entry.value {
                Value::Hash(fields) => {
                    fields.insert(field, value);
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::HashDelete { key, field } => {
            let now_empty = match entries.get_mut(&key).map(|entry| &mut entry.value) {
                Some(Value::Hash(fields)) => {
                    fields.remove(&field);
                    fields.is_empty()
                }
                Some(_) => return Err(wrong_type(&key)),
                None => false,
            };
            if now_empty {
                entries.remove(&key);
            }
        }
        WriteOp::Expire { key, ttl } => {
            if let Some(entry) = entries.get_mut(&key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
    }
    Ok(())
}

fn list_of(entries: &HashMap<String, Entry>, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
    match entries.get(key).map(|entry| &entry.value) {
        Some(Value::List(items)) => Ok(items.clone()),
        Some(_) => Err(wrong_type(key)),
        None => Ok(Vec::new()),
    }
}

fn hash_has(entries: &HashMap<String, Entry>, key: &str, field: &str) -> Result<bool, KvError> {
    match entries.get(key).map(|entry| &entry.value) {
        Some(Value::Hash(fields)) => Ok(fields.contains_key(field)),
        Some(_) => Err(wrong_type(key)),
        None => Ok(false),
    }
}

#[async_trait::async_trait]
impl KvBackend for MemoryBackend {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Scalar(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        Ok(entries.contains_key(key))
    }

    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        list_of(&entries, key)
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        hash_has(&entries, key, field)
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        match entries.get(key).map(|entry| &entry.value) {
            Some(Value::Hash(fields)) => Ok(fields.keys().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn atomic(&self, ops: Vec<WriteOp>) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);

        // Stage only the touched keys so a failing op leaves nothing half-applied.
        // A key whose first op is a delete starts empty and is never copied.
        let mut touched = HashSet::new();
        let mut staged = HashMap::new();
        for op in &ops {
            let key = op_key(op);
            if touched.insert(key.to_string()) && !matches!(op, WriteOp::Delete { .. }) {
                if let Some(entry) = entries.get(key) {
                    staged.insert(key.to_string(), entry.clone());
                }
            }
        }
        for op in ops {
            apply(&mut staged, op)?;
        }

        for key in touched {
            match staged.remove(&key) {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn take_list(
        &self,
        key: &str,
        registry: &str,
        field: &str,
    ) -> Result<Option<Vec<Vec<u8>>>, KvError> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        let registered = hash_has(&entries, registry, field)?;
        let chunks = list_of(&entries, key)?;
        apply(&mut entries, WriteOp::Delete { key: key.to_string() })?;
        apply(
            &mut entries,
            WriteOp::HashDelete {
                key: registry.to_string(),
                field: field.to_string(),
            },
        )?;
        Ok(registered.then_some(chunks))
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scalar_set_get_and_expiry() {
        let kv = MemoryBackend::new();
        kv.set("a", b"1".to_vec(), None).await.unwrap();
        kv.set("b", b"2".to_vec(), Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(kv.exists("b").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!kv.exists("b").await.unwrap());
        assert_eq!(kv.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn atomic_batch_builds_list_and_hash() {
        let kv = MemoryBackend::new();
        kv.atomic(vec![
            WriteOp::ListPush { key: "l".into(), value: b"x".to_vec() },
            WriteOp::ListPush { key: "l".into(), value: b"y".to_vec() },
            WriteOp::HashSet { key: "h".into(), field: "f".into(), value: b"1".to_vec() },
        ])
        .await
        .unwrap();

        assert_eq!(kv.list_range("l").await.unwrap(), vec![b"x".to_vec(), b"y".to_vec()]);
        assert!(kv.hash_exists("h", "f").await.unwrap());
        assert_eq!(kv.hash_keys("h").await.unwrap(), vec!["f".to_string()]);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let kv = MemoryBackend::new();
        kv.set("s", b"v".to_vec(), None).await.unwrap();
        let err = kv.list_range("s").await.unwrap_err();
        assert!(matches!(err, KvError::WrongType(key) if key == "s"));
    }

    #[tokio::test]
    async fn failing_batch_applies_nothing() {
        let kv = MemoryBackend::new();
        kv.set("s", b"v".to_vec(), None).await.unwrap();
        kv.atomic(vec![WriteOp::ListPush { key: "l".into(), value: b"old".to_vec() }])
            .await
            .unwrap();

        let err = kv
            .atomic(vec![
                WriteOp::Delete { key: "l".into() },
                WriteOp::ListPush { key: "l".into(), value: b"new".to_vec() },
                WriteOp::HashSet { key: "s".into(), field: "f".into(), value: b"1".to_vec() },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, KvError::WrongType(key) if key == "s"));
        assert_eq!(kv.list_range("l").await.unwrap(), vec![b"old".to_vec()]);
        assert_eq!(kv.get("s").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn batch_leaves_untouched_keys_alone() {
        let kv = MemoryBackend::new();
        kv.set("other", b"keep".to_vec(), Some(Duration::from_secs(60))).await.unwrap();
        kv.atomic(vec![
            WriteOp::ListPush { key: "l".into(), value: b"x".to_vec() },
            WriteOp::Delete { key: "missing".into() },
        ])
        .await
        .unwrap();

        assert_eq!(kv.get("other").await.unwrap(), Some(b"keep".to_vec()));
        assert!(!kv.exists("missing").await.unwrap());
        assert_eq!(kv.list_range("l").await.unwrap(), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn take_list_only_reports_registered_fields() {
        let kv = MemoryBackend::new();
        assert_eq!(kv.take_list("l", "h", "f").await.unwrap(), None);

        kv.atomic(vec![
            WriteOp::ListPush { key: "l".into(), value: b"x".to_vec() },
            WriteOp::HashSet { key: "h".into(), field: "f".into(), value: b"1".to_vec() },
        ])
        .await
        .unwrap();

        assert_eq!(kv.take_list("l", "h", "f").await.unwrap(), Some(vec![b"x".to_vec()]));
        assert!(!kv.exists("l").await.unwrap());
        assert!(!kv.hash_exists("h", "f").await.unwrap());
    }
}
