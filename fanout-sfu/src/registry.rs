//! Session and stream registries
//!
//! Both registries live in one [`Registries`] aggregate guarded by a single
//! lock owned by [`crate::SfuManager`]. Nothing here locks on its own.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{LocalOf, MediaEngine};
use crate::signaling::SignalSender;
use crate::types::{SessionId, StreamId};

/// A registered session
pub struct SessionEntry<E: MediaEngine> {
    pub id: SessionId,
    pub media: Arc<E::Session>,
    pub signal: Arc<dyn SignalSender>,
    /// Set when the subscription set changed and the participant has not yet
    /// received an offer describing it. New sessions start with it set.
    pub(crate) needs_offer: bool,
}

impl<E: MediaEngine> SessionEntry<E> {
    pub fn new(id: SessionId, media: Arc<E::Session>, signal: Arc<dyn SignalSender>) -> Self {
        Self {
            id,
            media,
            signal,
            needs_offer: true,
        }
    }
}

/// Active sessions in join order plus the streams available for fan-out
pub struct Registries<E: MediaEngine> {
    pub(crate) sessions: Vec<SessionEntry<E>>,
    pub(crate) streams: HashMap<StreamId, Arc<LocalOf<E>>>,
}

impl<E: MediaEngine> Default for Registries<E> {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            streams: HashMap::new(),
        }
    }
}

impl<E: MediaEngine> Registries<E> {
    /// Register a session. Returns `false` if the ID is already present.
    pub fn insert_session(&mut self, entry: SessionEntry<E>) -> bool {
        if self.contains_session(&entry.id) {
            return false;
        }
        self.sessions.push(entry);
        true
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub fn remove_session(&mut self, id: &SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|entry| &entry.id != id);
        self.sessions.len() != before
    }

    /// Remove every session in `ids`, returning how many were present
    pub fn remove_sessions(&mut self, ids: &[SessionId]) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|entry| !ids.contains(&entry.id));
        before - self.sessions.len()
    }

    #[must_use]
    pub fn contains_session(&self, id: &SessionId) -> bool {
        self.sessions.iter().any(|entry| &entry.id == id)
    }

    /// Insert or replace a stream, returning the previous one
    pub fn insert_stream(&mut self, id: StreamId, stream: Arc<LocalOf<E>>) -> Option<Arc<LocalOf<E>>> {
        self.streams.insert(id, stream)
    }

    /// Remove `id` only if it still maps to `stream`. A newer stream that
    /// reused the identifier is left alone.
    pub fn remove_stream(&mut self, id: &StreamId, stream: &Arc<LocalOf<E>>) -> bool {
        match self.streams.get(id) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                self.streams.remove(id);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn contains_stream(&self, id: &StreamId) -> bool {
        self.streams.contains_key(id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Session IDs in registry order
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Stream IDs, sorted
    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeEngine, FakeSignal, FakeStream};

    fn entry(id: &str) -> SessionEntry<FakeEngine> {
        let engine = FakeEngine::new();
        SessionEntry::new(SessionId::from(id), engine.detached_session(), FakeSignal::new())
    }

    #[test]
    fn test_session_insert_is_unique() {
        let mut registries = Registries::<FakeEngine>::default();
        assert!(registries.insert_session(entry("a")));
        assert!(!registries.insert_session(entry("a")));
        assert!(registries.insert_session(entry("b")));
        assert_eq!(registries.session_ids(), vec![SessionId::from("a"), SessionId::from("b")]);
    }

    #[test]
    fn test_session_removed_once() {
        let mut registries = Registries::<FakeEngine>::default();
        registries.insert_session(entry("a"));
        registries.insert_session(entry("b"));
        registries.insert_session(entry("c"));

        assert!(registries.remove_session(&SessionId::from("b")));
        assert!(!registries.remove_session(&SessionId::from("b")));
        assert_eq!(
            registries.remove_sessions(&[SessionId::from("a"), SessionId::from("zz")]),
            1
        );
        assert_eq!(registries.session_ids(), vec![SessionId::from("c")]);
    }

    #[test]
    fn test_stream_removal_respects_identity() {
        let mut registries = Registries::<FakeEngine>::default();
        let old = Arc::new(FakeStream::new("s1"));
        let new = Arc::new(FakeStream::new("s1"));

        registries.insert_stream(StreamId::from("s1"), Arc::clone(&old));
        registries.insert_stream(StreamId::from("s1"), Arc::clone(&new));

        assert!(!registries.remove_stream(&StreamId::from("s1"), &old));
        assert!(registries.contains_stream(&StreamId::from("s1")));
        assert!(registries.remove_stream(&StreamId::from("s1"), &new));
        assert_eq!(registries.stream_count(), 0);
    }
}
