//! Registry of live sessions
//!
//! Maps session id to its state and transport id to its transport. Owned by
//! the orchestrator and shared with session drivers; there is no global
//! instance.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::driver::{CloseCause, SessionEvent};
use super::state::{ArtifactKeys, SessionState};
use crate::transport::Transport;

/// A registered session and the handles needed to tear it down
#[derive(Clone)]
pub struct SessionEntry {
    pub state: Arc<SessionState>,
    pub transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEntry {
    pub fn new(
        state: Arc<SessionState>,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            state,
            transport,
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn transport_id(&self) -> &str {
        &self.state.transport_id
    }

    /// Ask the session driver to tear down.
    ///
    /// Returns `None` when the driver has already exited.
    pub fn request_close(&self, cause: CloseCause) -> Option<oneshot::Receiver<ArtifactKeys>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(SessionEvent::CloseRequested { cause, reply })
            .ok()
            .map(|_| rx)
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("session_id", &self.session_id())
            .field("transport_id", &self.transport_id())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    transports: HashMap<String, Arc<dyn Transport>>,
}

/// Session registry
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry, returning the one it displaced
    pub async fn insert(&self, entry: SessionEntry) -> Option<SessionEntry> {
        let mut inner = self.inner.write().await;
        inner
            .transports
            .insert(entry.transport_id().to_string(), Arc::clone(&entry.transport));
        let previous = inner.sessions.insert(entry.session_id().to_string(), entry);
        if let Some(prev) = &previous {
            inner.transports.remove(prev.transport_id());
        }
        previous
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    pub async fn transport(&self, transport_id: &str) -> Option<Arc<dyn Transport>> {
        self.inner.read().await.transports.get(transport_id).cloned()
    }

    /// Remove the session only if it is still bound to `transport_id`.
    ///
    /// A driver tearing down a replaced session must not remove the entry
    /// that replaced it.
    pub async fn remove_if_transport(&self, session_id: &str, transport_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.transports.remove(transport_id);
        let matches = inner
            .sessions
            .get(session_id)
            .map(|entry| entry.transport_id() == transport_id)
            .unwrap_or(false);
        if matches {
            inner.sessions.remove(session_id);
        }
        matches
    }

    pub async fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.remove(session_id)?;
        inner.transports.remove(entry.transport_id());
        Some(entry)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.inner.read().await.sessions.keys().cloned().collect()
    }

    pub async fn entries(&self) -> Vec<SessionEntry> {
        self.inner.read().await.sessions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ContainerFormat;
    use crate::metrics::CaptureMetrics;
    use crate::recorder::{RecorderController, WriterFactory};
    use crate::testing::{ScriptedWriterFactory, StubTransport};

    fn entry(session_id: &str, transport_id: &str) -> SessionEntry {
        let recorder = RecorderController::new(
            session_id,
            std::env::temp_dir(),
            ContainerFormat::Matroska,
            ContainerFormat::Webm,
            Arc::new(ScriptedWriterFactory::new(vec![])) as Arc<dyn WriterFactory>,
            Arc::new(CaptureMetrics::new()),
        );
        let state = Arc::new(SessionState::new(
            session_id,
            transport_id,
            None,
            std::env::temp_dir(),
            recorder,
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionEntry::new(state, Arc::new(StubTransport::new(transport_id)), tx)
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let registry = SessionRegistry::new();
        assert!(registry.insert(entry("s1", "t1")).await.is_none());

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("s1").await.unwrap().transport_id(), "t1");
        assert_eq!(registry.transport("t1").await.unwrap().id(), "t1");
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_replacement_keeps_one_entry_per_session() {
        let registry = SessionRegistry::new();
        registry.insert(entry("s1", "t1")).await;
        let displaced = registry.insert(entry("s1", "t2")).await.unwrap();

        assert_eq!(displaced.transport_id(), "t1");
        assert_eq!(registry.len().await, 1);
        assert!(registry.transport("t1").await.is_none());
        assert!(registry.transport("t2").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_transport_cannot_remove_replacement() {
        let registry = SessionRegistry::new();
        registry.insert(entry("s1", "t2")).await;

        assert!(!registry.remove_if_transport("s1", "t1").await);
        assert_eq!(registry.session_ids().await, vec!["s1".to_string()]);

        assert!(registry.remove_if_transport("s1", "t2").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_request_close_after_driver_exit() {
        let entry = entry("s1", "t1");
        // The receiver was dropped in `entry`, as when a driver has exited
        assert!(entry.request_close(CloseCause::Explicit).is_none());
    }
}
