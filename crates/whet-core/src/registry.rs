//! Mapping from resource IDs to live sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::session::Session;

/// Sessions keyed by the resource ID minted during signaling.
///
/// Every operation takes the single lock briefly; nothing iterates or does
/// I/O while holding it. Servers carry their own registry instance; sessions
/// dialed from this process share [`client_sessions`].
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: Uuid, session: Arc<Session>) {
        self.inner.lock().unwrap().insert(id, session);
    }

    /// Idempotent: removing an absent ID is a no-op.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn lookup(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the registry and closes every remaining session. Used on
    /// process shutdown so all sessions pass through the Closing path.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.close().await;
        }
    }
}

static CLIENT_SESSIONS: Lazy<Arc<SessionRegistry>> = Lazy::new(SessionRegistry::new);

/// Process-wide registry for sessions dialed by this process.
pub fn client_sessions() -> &'static Arc<SessionRegistry> {
    &CLIENT_SESSIONS
}
