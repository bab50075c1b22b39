//! SFU Manager - owns the shared registries and the media engine
//!
//! This module provides:
//! - The single lock guarding the session and stream registries
//! - Registry mutations (each followed by a synchronization pass where required)
//! - Statistics and shutdown
//!
//! The synchronization algorithm lives in [`crate::sync`], keyframe dispatch
//! in [`crate::keyframe`], per-session handling in [`crate::session`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::engine::{LocalOf, LocalStream, MediaEngine, MediaSession};
use crate::registry::{Registries, SessionEntry};
use crate::types::{SessionId, StreamId};

/// Snapshot of the registries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SfuStats {
    /// Number of registered sessions
    pub sessions: usize,
    /// Number of streams available for fan-out
    pub streams: usize,
}

/// SFU Manager - the shared state every session and stream routes through
pub struct SfuManager<E: MediaEngine> {
    engine: E,
    config: Arc<SfuConfig>,
    /// Session and stream registries behind one lock. Held for registry
    /// mutations and for the whole synchronization loop, never across a
    /// network wait for inbound data.
    state: Mutex<Registries<E>>,
}

impl<E: MediaEngine> SfuManager<E> {
    /// Create a new SFU manager
    pub fn new(engine: E, config: SfuConfig) -> Arc<Self> {
        info!(
            max_sync_attempts = config.max_sync_attempts,
            sync_retry_delay_secs = config.sync_retry_delay_secs,
            keyframe_interval_secs = config.keyframe_interval_secs,
            "SFU Manager initialized"
        );

        Arc::new(Self {
            engine,
            config: Arc::new(config),
            state: Mutex::new(Registries::default()),
        })
    }

    /// Get the media engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Get configuration
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Registries<E>> {
        self.state.lock().await
    }

    /// Register a session. Returns `false` if the ID is already registered.
    pub async fn add_session(&self, entry: SessionEntry<E>) -> bool {
        let session_id = entry.id.clone();
        let mut state = self.lock().await;
        let inserted = state.insert_session(entry);
        if inserted {
            debug!(session_id = %session_id, total_sessions = state.session_count(), "Added session");
        } else {
            warn!(session_id = %session_id, "Session already registered");
        }
        inserted
    }

    /// Remove a session. Returns `false` if it was already gone.
    pub async fn remove_session(&self, session_id: &SessionId) -> bool {
        let mut state = self.lock().await;
        let removed = state.remove_session(session_id);
        if removed {
            debug!(session_id = %session_id, total_sessions = state.session_count(), "Removed session");
        }
        removed
    }

    /// Make a stream available to every session, then synchronize
    pub async fn publish_stream(self: &Arc<Self>, stream: Arc<LocalOf<E>>) {
        let stream_id = stream.id().clone();
        {
            let mut state = self.lock().await;
            if state.insert_stream(stream_id.clone(), stream).is_some() {
                warn!(stream_id = %stream_id, "Replaced a stream with the same identifier");
            }
            debug!(stream_id = %stream_id, total_streams = state.stream_count(), "Published stream");
        }
        self.synchronize().await;
    }

    /// Withdraw a stream, then synchronize
    pub async fn unpublish_stream(self: &Arc<Self>, stream: &Arc<LocalOf<E>>) {
        let stream_id = stream.id().clone();
        {
            let mut state = self.lock().await;
            if state.remove_stream(&stream_id, stream) {
                debug!(stream_id = %stream_id, total_streams = state.stream_count(), "Unpublished stream");
            }
        }
        self.synchronize().await;
    }

    /// Get registry statistics
    pub async fn stats(&self) -> SfuStats {
        let state = self.lock().await;
        SfuStats {
            sessions: state.session_count(),
            streams: state.stream_count(),
        }
    }

    /// IDs of registered sessions in join order
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.lock().await.session_ids()
    }

    /// IDs of streams available for fan-out, sorted
    pub async fn stream_ids(&self) -> Vec<StreamId> {
        self.lock().await.stream_ids()
    }

    /// Close every registered session. Each one leaves the registry through
    /// its own `Closed` transition.
    pub async fn shutdown(&self) {
        let sessions: Vec<(SessionId, Arc<E::Session>)> = {
            let state = self.lock().await;
            state
                .sessions
                .iter()
                .map(|entry| (entry.id.clone(), Arc::clone(&entry.media)))
                .collect()
        };

        info!(sessions = sessions.len(), "Closing all sessions");

        for (session_id, media) in sessions {
            if let Err(e) = media.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close session");
            }
        }
    }
}
