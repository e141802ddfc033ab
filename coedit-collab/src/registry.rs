//! Per-document session registry.
//!
//! Callers hold a handle obtained from here, never a shared mutable engine:
//! each document gets exactly one session actor per registry, created on
//! first join and torn down on leave. The local user's identity comes from
//! the identity provider; this layer only consumes it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::{SessionConfig, SessionHandle, SyncError};
use crate::transport::{IdentityProvider, SnapshotStore, Transport};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SnapshotStore>,
    identity: Arc<dyn IdentityProvider>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SnapshotStore>,
        identity: Arc<dyn IdentityProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transport,
            store,
            identity,
            config,
        }
    }

    /// Join a document, creating its session on first touch. A second join
    /// of the same document returns the existing handle.
    pub async fn join(&self, doc_id: Uuid) -> Result<Arc<SessionHandle>, SyncError> {
        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&doc_id) {
                return Ok(handle.clone());
            }
        }

        // Slow path: create under the write lock, double-checking.
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&doc_id) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(
            SessionHandle::join(
                doc_id,
                self.identity.profile(),
                self.transport.clone(),
                self.store.clone(),
                self.config.clone(),
            )
            .await?,
        );
        sessions.insert(doc_id, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, doc_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&doc_id).cloned()
    }

    /// Leave a document and drop its session. Returns false if it was not
    /// open.
    pub async fn leave(&self, doc_id: Uuid) -> bool {
        let handle = self.sessions.write().await.remove(&doc_id);
        match handle {
            Some(handle) => {
                let _ = handle.leave().await;
                true
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn open_documents(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
