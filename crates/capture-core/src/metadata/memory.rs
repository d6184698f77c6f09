//! In-process metadata store

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{MetadataStore, SessionCompletion, SessionRecord};
use crate::Result;

/// Stored row: the start record plus the latest completion, if any
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub record: Option<SessionRecord>,
    pub completion: Option<SessionCompletion>,
}

/// Metadata store backed by a map
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    rows: Mutex<HashMap<String, MemoryRow>>,
    updates: Mutex<Vec<String>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, session_id: &str) -> Option<MemoryRow> {
        self.rows.lock().get(session_id).cloned()
    }

    /// Session ids in the order `complete_session` was called
    pub fn completions(&self) -> Vec<String> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.entry(record.id.clone()).or_insert(MemoryRow {
            record: None,
            completion: None,
        });
        row.record = Some(record.clone());
        row.completion = None;
        Ok(())
    }

    async fn complete_session(&self, session_id: &str, completion: &SessionCompletion) -> Result<()> {
        self.updates.lock().push(session_id.to_string());
        // Like a PATCH on a missing row, this is a no-op
        if let Some(row) = self.rows.lock().get_mut(session_id) {
            row.completion = Some(completion.clone());
        }
        Ok(())
    }
}
