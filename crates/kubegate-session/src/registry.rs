use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

/// Who created a session, encoded as a prefix of the session id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionOrigin {
    /// Created through the user-facing endpoints, listed back to the client
    User,
    /// Managed by the gateway itself, never listed
    Internal,
}

impl SessionOrigin {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "user_",
            Self::Internal => "internal_",
        }
    }

    /// Generate a fresh session id carrying this origin's prefix
    pub fn new_id(self) -> String {
        format!("{}{}", self.prefix(), Uuid::new_v4())
    }

    /// Whether a session id was generated for this origin
    pub fn owns(self, id: &str) -> bool {
        id.starts_with(self.prefix())
    }
}

/// Thread-safe map of active sessions keyed by session id.
///
/// Writers take the exclusive lock, readers the shared one, and neither is
/// held across I/O. Entries are only removed by an explicit `delete`.
pub struct SessionRegistry<S> {
    sessions: Arc<RwLock<HashMap<String, S>>>,
}

impl<S: Clone> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a session, returning the one previously stored under `id`
    pub fn put(&self, id: impl Into<String>, session: S) -> Option<S> {
        self.sessions.write().insert(id.into(), session)
    }

    pub fn get(&self, id: &str) -> Option<S> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session. Deleting an unknown id is not an error.
    pub fn delete(&self, id: &str) -> Option<S> {
        self.sessions.write().remove(id)
    }

    /// Snapshot of all sessions
    pub fn list(&self) -> Vec<S> {
        self.sessions.read().values().cloned().collect()
    }

    /// Snapshot of the sessions whose id carries the origin's prefix
    pub fn list_by_origin(&self, origin: SessionOrigin) -> Vec<S> {
        self.sessions
            .read()
            .iter()
            .filter(|(id, _)| origin.owns(id))
            .map(|(_, session)| session.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl<S> Clone for SessionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<S: Clone> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
