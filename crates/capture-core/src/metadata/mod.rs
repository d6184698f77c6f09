//! Per-session metadata record
//!
//! One row per session id: upserted when the offer is accepted and updated
//! when the session is finalized. Callers log failures and carry on.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use memory::MemoryMetadataStore;

/// Status column of a session row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

/// Row written when a session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
    pub status: SessionStatus,
}

/// Fields written when a session ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletion {
    pub ended_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub storage_recording_key: Option<String>,
    pub storage_audio_key: Option<String>,
}

impl SessionCompletion {
    pub fn completed(video_key: Option<String>, audio_key: Option<String>) -> Self {
        Self {
            ended_at: Utc::now(),
            status: SessionStatus::Completed,
            storage_recording_key: video_key,
            storage_audio_key: audio_key,
        }
    }
}

/// Upsert/update interface over the session table
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert the row or merge into an existing row with the same id
    async fn upsert_session(&self, record: &SessionRecord) -> Result<()>;

    /// Update the row for `session_id`; a missing row is not an error
    async fn complete_session(&self, session_id: &str, completion: &SessionCompletion) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_completion_serializes_null_keys() {
        let completion = SessionCompletion::completed(Some("sessions/a/recording.mp4".into()), None);
        let value = serde_json::to_value(&completion).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["storage_recording_key"], "sessions/a/recording.mp4");
        assert!(value["storage_audio_key"].is_null());
    }
}
