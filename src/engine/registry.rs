use crate::engine::session::SessionGroup;
use crate::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tracing::debug;

/// Live sessions by logical key. At most one session per key.
///
/// Writers take the lock exclusively; readers share it, so status queries
/// never wait behind each other.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: StdRwLock<HashMap<String, Arc<SessionGroup>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&self, key: &str, session: Arc<SessionGroup>) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(key) {
            return Err(AppError::DuplicateSession(key.to_string()));
        }
        debug!(key = %key, pgid = session.process_group_id(), "Registering session");
        sessions.insert(key.to_string(), session);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<SessionGroup>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    pub fn unregister(&self, key: &str) -> Result<Arc<SessionGroup>, AppError> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .ok_or_else(|| AppError::SessionNotFound(key.to_string()))
    }

    /// Removes `key` only if it still maps to this exact session.
    pub fn unregister_if_same(&self, key: &str, session: &Arc<SessionGroup>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn all(&self) -> Vec<Arc<SessionGroup>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
