use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tokio::sync::RwLock;

use super::{SessionId, streamable_http_server::session::SessionTransport};

/// Lookup table from session id to the transport serving it.
///
/// Entries do not own their transport: whoever serves the transport keeps it
/// alive, and the transport removes its own entry when it closes. Cloning
/// the registry yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Weak<SessionTransport>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: SessionId, transport: &Arc<SessionTransport>) {
        self.register_weak(id, Arc::downgrade(transport)).await
    }

    pub(crate) async fn register_weak(&self, id: SessionId, transport: Weak<SessionTransport>) {
        tracing::debug!(session_id = %id, "register session");
        if self.sessions.write().await.insert(id.clone(), transport).is_some() {
            tracing::warn!(session_id = %id, "replaced an existing session entry");
        }
    }

    /// Returns whether an entry was removed.
    pub async fn unregister(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "unregister session");
        }
        removed
    }

    /// Resolve a live transport. Entries whose transport is gone are pruned.
    pub async fn get(&self, id: &str) -> Option<Arc<SessionTransport>> {
        let found = self.sessions.read().await.get(id).cloned()?;
        match found.upgrade() {
            Some(transport) => Some(transport),
            None => {
                self.sessions.write().await.remove(id);
                None
            }
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Close every registered transport. Each one unregisters itself.
    pub async fn close_all(&self) {
        let transports: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for transport in transports {
            transport.close().await;
        }
        self.sessions.write().await.clear();
    }
}
