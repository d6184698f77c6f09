//! In-process object store
//!
//! Used by tests and local runs without a storage service. Failures can be
//! injected per key suffix to exercise partial-upload paths.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ObjectStore, StoredObject, UploadResult};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct MemoryObject {
    body: Bytes,
    content_type: String,
}

/// Object store backed by a map
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    failing_suffixes: Mutex<Vec<String>>,
    puts: AtomicUsize,
    removes: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
            failing_suffixes: Mutex::new(Vec::new()),
            puts: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }

    /// Make every put whose key ends with `suffix` fail
    pub fn fail_puts_ending_with(&self, suffix: impl Into<String>) {
        self.failing_suffixes.lock().push(suffix.into());
    }

    /// Number of put calls, including failed ones
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|o| o.body.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|o| o.content_type.clone())
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("recordings")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<UploadResult> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_suffixes
            .lock()
            .iter()
            .any(|suffix| key.ends_with(suffix.as_str()))
        {
            return Err(Error::StorageError(format!("injected failure for {}", key)));
        }

        let size = body.len() as u64;
        self.objects.lock().insert(
            key.to_string(),
            MemoryObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(UploadResult {
            key: key.to_string(),
            bucket: self.bucket.clone(),
            size,
            content_type: content_type.to_string(),
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        Ok(self
            .objects
            .lock()
            .iter()
            .filter_map(|(key, object)| {
                key.strip_prefix(&dir).map(|name| StoredObject {
                    name: name.to_string(),
                    size: Some(object.body.len() as u64),
                    updated_at: None,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_list_remove() {
        let store = MemoryObjectStore::new("recordings");
        store
            .put("sessions/a/audio.wav", Bytes::from_static(b"RIFF"), "audio/wav")
            .await
            .unwrap();
        store
            .put("sessions/b/audio.wav", Bytes::from_static(b"RIFF"), "audio/wav")
            .await
            .unwrap();

        let listed = store.list("sessions/a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "audio.wav");
        assert_eq!(listed[0].size, Some(4));

        store.remove("sessions/a/audio.wav").await.unwrap();
        store.remove("sessions/a/audio.wav").await.unwrap();
        assert!(store.list("sessions/a").await.unwrap().is_empty());
        assert_eq!(store.remove_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryObjectStore::default();
        store.fail_puts_ending_with("audio.wav");

        let err = store
            .put("sessions/a/audio.wav", Bytes::new(), "audio/wav")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageError(_)));
        assert!(store.keys().is_empty());
        assert_eq!(store.put_count(), 1);
    }
}
