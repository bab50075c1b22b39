//! Renegotiation synchronizer
//!
//! Brings every session's outbound subscriptions in line with the stream
//! registry and sends a fresh offer to each session whose set changed.
//!
//! A pass holds the registry lock for its whole duration and runs up to
//! `max_sync_attempts` attempts. Any failed step restarts the attempt from
//! the first session. When the bound is hit the lock is released and a
//! deferred pass is scheduled on its own task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::engine::{LocalOf, MediaEngine, MediaSession};
use crate::error::RenegotiationError;
use crate::manager::SfuManager;
use crate::registry::{Registries, SessionEntry};
use crate::signaling::SignalMessage;
use crate::types::{SessionId, StreamId};

/// Result of one synchronization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every session matches the stream registry
    Converged { attempts: usize },
    /// The attempt bound was hit; a deferred pass has been scheduled
    Deferred,
}

impl SyncOutcome {
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

enum Attempt {
    /// Nothing left to do
    Converged,
    /// Offers went out; run again to confirm
    Changed,
    /// The registry was mutated or a step failed
    Retry,
}

impl<E: MediaEngine> SfuManager<E> {
    /// Run a synchronization pass, then dispatch keyframes.
    ///
    /// Safe to call from any number of tasks at once: passes are serialized
    /// by the registry lock and each recomputes the desired state from
    /// scratch.
    pub async fn synchronize(self: &Arc<Self>) -> SyncOutcome {
        let max_attempts = self.config().max_sync_attempts;

        let outcome = {
            let mut state = self.lock().await;
            let mut outcome = SyncOutcome::Deferred;
            for attempt in 1..=max_attempts {
                if let Attempt::Converged = attempt_sync(&mut state).await {
                    outcome = SyncOutcome::Converged { attempts: attempt };
                    break;
                }
            }
            outcome
        };

        match outcome {
            SyncOutcome::Converged { attempts } => {
                trace!(attempts, "Synchronization converged");
            }
            SyncOutcome::Deferred => {
                warn!(
                    max_attempts,
                    retry_in_secs = self.config().sync_retry_delay_secs,
                    "Synchronization did not converge, deferring"
                );
                self.schedule_sync_retry();
            }
        }

        self.dispatch_keyframes().await;
        outcome
    }

    /// Spawn a pass after `sync_retry_delay`. Called only once the lock has
    /// been released.
    fn schedule_sync_retry(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let delay = self.config().sync_retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.synchronize().await;
        });
    }
}

async fn attempt_sync<E: MediaEngine>(state: &mut Registries<E>) -> Attempt {
    let closed: Vec<SessionId> = state
        .sessions
        .iter()
        .filter(|entry| entry.media.connection_state().is_terminal())
        .map(|entry| entry.id.clone())
        .collect();

    if !closed.is_empty() {
        let removed = state.remove_sessions(&closed);
        debug!(removed, "Swept closed sessions");
        return Attempt::Retry;
    }

    let Registries { sessions, streams } = state;
    let mut changed = false;

    for entry in sessions.iter_mut() {
        match reconcile_session(entry, streams).await {
            Ok(offered) => changed |= offered,
            Err(e) => {
                debug!(session_id = %entry.id, error = %e, "Renegotiation step failed, retrying");
                return Attempt::Retry;
            }
        }
    }

    if changed {
        Attempt::Changed
    } else {
        Attempt::Converged
    }
}

/// Apply the registry to one session. Returns whether an offer was sent.
async fn reconcile_session<E: MediaEngine>(
    entry: &mut SessionEntry<E>,
    streams: &HashMap<StreamId, Arc<LocalOf<E>>>,
) -> Result<bool, RenegotiationError> {
    let media = Arc::clone(&entry.media);
    let mut known: HashSet<StreamId> = HashSet::new();

    for subscription in media.outbound_subscriptions().await {
        if streams.contains_key(&subscription.stream_id) {
            known.insert(subscription.stream_id);
        } else {
            media.unsubscribe(&subscription).await?;
            entry.needs_offer = true;
            debug!(session_id = %entry.id, stream_id = %subscription.stream_id, "Unsubscribed stream");
        }
    }

    // A session never receives its own contribution back
    known.extend(media.inbound_streams().await.into_iter().map(|inbound| inbound.stream_id));

    for (stream_id, stream) in streams {
        if known.contains(stream_id) {
            continue;
        }
        media.subscribe(stream).await?;
        entry.needs_offer = true;
        debug!(session_id = %entry.id, stream_id = %stream_id, "Subscribed stream");
    }

    if !entry.needs_offer {
        return Ok(false);
    }

    let offer = media.create_offer().await?;
    media.set_local_description(offer.clone()).await?;
    entry.signal.send(&SignalMessage::Offer(offer)).await?;
    entry.needs_offer = false;

    debug!(session_id = %entry.id, "Sent offer");
    Ok(true)
}
