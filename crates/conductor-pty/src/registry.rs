//! The session registry: one entry per live session id.
//!
//! The map lock is only ever held for the map operation itself. Sessions are
//! handed out as `Arc`s, so callers lock an individual session (or drop one,
//! which may kill its process) without holding up the rest of the registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use crate::error::{Result, SessionError};
use crate::session::{Session, SessionId};

/// Immutable snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub working_dir: PathBuf,
    pub created_at: SystemTime,
}

/// Concurrency-safe map from session id to session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session under its own id.
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        let id = session.id();
        let mut sessions = self.map();
        if sessions.contains_key(&id) {
            return Err(SessionError::DuplicateId(id));
        }
        sessions.insert(id, session);
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.map().get(id).cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.map().remove(id)
    }

    /// First session bound to `path`, if any.
    pub fn find_by_path(&self, path: &Path) -> Option<Arc<Session>> {
        self.map()
            .values()
            .find(|s| s.working_dir() == path)
            .cloned()
    }

    /// Snapshot of every entry, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .map()
            .values()
            .map(|s| SessionInfo {
                id: s.id(),
                working_dir: s.working_dir().to_path_buf(),
                created_at: s.created_at(),
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Remove and return every entry in one step.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.map().drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
