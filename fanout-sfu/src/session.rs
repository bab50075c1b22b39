//! Session lifecycle
//!
//! One call to [`SfuManager::serve_session`] drives a participant from the
//! accepted signaling channel to teardown:
//!
//! 1. The engine creates a receive-only session that reports candidates,
//!    state transitions and inbound streams as [`SessionEvent`]s.
//! 2. The session is registered and a synchronization pass runs.
//! 3. Inbound answers and candidates are applied until the channel ends,
//!    a message is malformed, or the connection closes.
//! 4. The engine session and the signaling channel are released.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EventReceiver, MediaEngine, MediaSession, SessionEvent};
use crate::error::SessionError;
use crate::manager::SfuManager;
use crate::registry::SessionEntry;
use crate::signaling::{IceCandidate, SignalMessage, SignalReceiver, SignalSender};
use crate::types::{ConnectionState, SessionId};

impl<E: MediaEngine> SfuManager<E> {
    /// Serve one participant until its session ends.
    ///
    /// Errors end only this session and are returned for the caller to log.
    pub async fn serve_session<R: SignalReceiver>(
        self: &Arc<Self>,
        signal: Arc<dyn SignalSender>,
        mut receiver: R,
    ) -> Result<(), SessionError> {
        let session_id = SessionId::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let media = match self.engine().create_session(events_tx).await {
            Ok(media) => media,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to create session");
                signal.close().await;
                return Err(SessionError::Setup(e));
            }
        };

        let entry = SessionEntry::new(session_id.clone(), Arc::clone(&media), Arc::clone(&signal));
        if !self.add_session(entry).await {
            if let Err(e) = media.close().await {
                warn!(session_id = %session_id, error = %e, "Failed to close duplicate session");
            }
            signal.close().await;
            return Err(SessionError::Duplicate(session_id));
        }
        info!(session_id = %session_id, "Session started");

        let closed = CancellationToken::new();
        let events_task = tokio::spawn(Arc::clone(self).run_session_events(
            session_id.clone(),
            Arc::downgrade(&media),
            Arc::clone(&signal),
            events_rx,
            closed.clone(),
        ));

        self.synchronize().await;

        let result = receive_loop(&session_id, media.as_ref(), &mut receiver, &closed).await;
        if let Err(e) = &result {
            debug!(session_id = %session_id, error = %e, "Receive loop ended with error");
        }

        match media.close().await {
            Ok(()) => {
                if let Err(e) = events_task.await {
                    warn!(session_id = %session_id, error = %e, "Session event task failed");
                }
            }
            Err(e) => {
                // No Closed transition will follow; tear down directly
                warn!(session_id = %session_id, error = %e, "Failed to close session");
                events_task.abort();
                if self.remove_session(&session_id).await {
                    self.synchronize().await;
                }
            }
        }
        signal.close().await;

        info!(session_id = %session_id, "Session ended");
        result
    }

    /// Dispatch engine events for one session until it closes
    async fn run_session_events(
        self: Arc<Self>,
        session_id: SessionId,
        media: Weak<E::Session>,
        signal: Arc<dyn SignalSender>,
        mut events: EventReceiver<E::Remote>,
        closed: CancellationToken,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Candidate(candidate) => {
                    on_local_candidate(&session_id, signal.as_ref(), candidate).await;
                }
                SessionEvent::StateChanged(state) => {
                    self.on_state_change(&session_id, &media, state).await;
                    if state.is_terminal() {
                        break;
                    }
                }
                SessionEvent::InboundStream(remote) => {
                    self.on_inbound_stream(&session_id, remote);
                }
            }
        }
        closed.cancel();
    }

    async fn on_state_change(
        self: &Arc<Self>,
        session_id: &SessionId,
        media: &Weak<E::Session>,
        state: ConnectionState,
    ) {
        info!(session_id = %session_id, state = %state, "Connection state changed");

        match state {
            ConnectionState::Failed => {
                if let Some(media) = media.upgrade() {
                    if let Err(e) = media.close().await {
                        warn!(session_id = %session_id, error = %e, "Failed to close failed session");
                    }
                }
            }
            ConnectionState::Closed => {
                if self.remove_session(session_id).await {
                    self.synchronize().await;
                }
            }
            _ => {}
        }
    }

    fn on_inbound_stream(self: &Arc<Self>, session_id: &SessionId, remote: E::Remote) {
        tokio::spawn(Arc::clone(self).forward_stream(session_id.clone(), remote));
    }
}

/// Relay a locally gathered candidate as soon as it appears
async fn on_local_candidate(session_id: &SessionId, signal: &dyn SignalSender, candidate: IceCandidate) {
    if let Err(e) = signal.send(&SignalMessage::Candidate(candidate)).await {
        debug!(session_id = %session_id, error = %e, "Failed to send local candidate");
    }
}

async fn receive_loop<S, R>(
    session_id: &SessionId,
    media: &S,
    receiver: &mut R,
    closed: &CancellationToken,
) -> Result<(), SessionError>
where
    S: MediaSession + ?Sized,
    R: SignalReceiver,
{
    loop {
        let frame = tokio::select! {
            () = closed.cancelled() => return Ok(()),
            frame = receiver.recv() => frame,
        };

        let Some(frame) = frame else {
            debug!(session_id = %session_id, "Signaling channel closed by participant");
            return Ok(());
        };

        match SignalMessage::decode(&frame?)? {
            Some(SignalMessage::Candidate(candidate)) => {
                media.add_remote_candidate(candidate).await?;
            }
            Some(SignalMessage::Answer(answer)) => {
                media.set_remote_description(answer).await?;
            }
            Some(SignalMessage::Offer(_)) => {
                debug!(session_id = %session_id, "Ignoring offer from participant");
            }
            None => {
                debug!(session_id = %session_id, "Ignoring unknown signaling event");
            }
        }
    }
}
