//! Object storage seam for session artifacts
//!
//! Keys are laid out as `sessions/{session_id}/{artifact}`. Adapters
//! translate provider responses into [`UploadResult`] so callers never see
//! provider-specific shapes.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use memory::MemoryObjectStore;

/// Normalized outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// Object path within the bucket
    pub key: String,
    pub bucket: String,
    pub size: u64,
    pub content_type: String,
}

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Put/remove/list by key within one bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<UploadResult>;

    /// Remove an object; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// List objects directly under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;
}

/// `sessions/{session_id}/{artifact}`
pub fn session_key(session_id: &str, artifact: &str) -> String {
    format!("{}/{}", session_prefix(session_id), artifact)
}

/// `sessions/{session_id}`
pub fn session_prefix(session_id: &str) -> String {
    format!("sessions/{}", session_id)
}

/// Content type derived from an artifact's extension
pub fn content_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".mkv") {
        "video/x-matroska"
    } else if lower.ends_with(".webm") {
        "video/webm"
    } else if lower.ends_with(".mp4") {
        "video/mp4"
    } else {
        "audio/wav"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_layout() {
        assert_eq!(session_key("abc", "audio.wav"), "sessions/abc/audio.wav");
        assert_eq!(session_prefix("abc"), "sessions/abc");
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("recording.mkv"), "video/x-matroska");
        assert_eq!(content_type_for("recording.WEBM"), "video/webm");
        assert_eq!(content_type_for("recording.mp4"), "video/mp4");
        assert_eq!(content_type_for("audio.wav"), "audio/wav");
    }
}
