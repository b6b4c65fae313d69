use parking_lot::RwLock;
use std::collections::HashMap;

use crate::config::SessionConfig;
use crate::workload::WorkloadSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub id: String,
    pub attach_enabled: bool,
    pub workload: WorkloadSpec,
}

/// Attachable sessions known to this server.
#[derive(Debug, Default)]
pub struct Catalog {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl Catalog {
    pub fn from_config(sessions: &[SessionConfig]) -> Self {
        let catalog = Catalog::default();
        for session in sessions {
            catalog.insert(SessionEntry {
                id: session.id.clone(),
                attach_enabled: session.attach_enabled,
                workload: session.workload.clone(),
            });
        }
        catalog
    }

    pub fn insert(&self, entry: SessionEntry) {
        self.sessions.write().insert(entry.id.clone(), entry);
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Returns false when the session is unknown.
    pub fn set_attach_enabled(&self, session_id: &str, enabled: bool) -> bool {
        match self.sessions.write().get_mut(session_id) {
            Some(entry) => {
                entry.attach_enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
