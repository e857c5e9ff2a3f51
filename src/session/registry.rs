//! Concurrent map of active transcription sessions.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use super::session::TranscriptionSession;

#[derive(Debug, Error)]
#[error("a transcription session already exists for {0}")]
pub struct AlreadyRegistered(pub String);

/// Maps speaker identity to its live session.
///
/// Constructed once per running service instance and passed into the
/// orchestration layer; insert, lookup and remove may race freely across
/// speaker pipelines and teardown triggers. At most one session per
/// identity: a second registration for the same identity is rejected.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<TranscriptionSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        identity: &str,
        session: Arc<TranscriptionSession>,
    ) -> Result<(), AlreadyRegistered> {
        match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(_) => Err(AlreadyRegistered(identity.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Remove and return the session for `identity`, if registered. The
    /// caller owns the subsequent disconnect, so removal is visible before
    /// the connection close completes.
    pub fn remove(&self, identity: &str) -> Option<Arc<TranscriptionSession>> {
        self.sessions.remove(identity).map(|(_, session)| session)
    }

    /// Clone out the current sessions, for iteration that must not hold
    /// map shards across await points.
    pub fn snapshot(&self) -> Vec<(String, Arc<TranscriptionSession>)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Remove every session, returning them for teardown.
    pub fn drain(&self) -> Vec<(String, Arc<TranscriptionSession>)> {
        let identities: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        identities
            .into_iter()
            .filter_map(|identity| self.sessions.remove(&identity))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
