//! Keyframe dispatcher
//!
//! Periodically asks every contributing participant for a fresh reference
//! frame so viewers that just subscribed can start decoding.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::engine::{MediaEngine, MediaSession};
use crate::manager::SfuManager;

impl<E: MediaEngine> SfuManager<E> {
    /// Send one picture loss indication per inbound stream of every session.
    /// Returns how many were sent. Failures are skipped; the next tick retries.
    pub async fn dispatch_keyframes(&self) -> usize {
        let state = self.lock().await;
        let mut sent = 0;

        for entry in &state.sessions {
            for inbound in entry.media.inbound_streams().await {
                match entry.media.send_picture_loss(inbound.ssrc).await {
                    Ok(()) => sent += 1,
                    Err(e) => trace!(
                        session_id = %entry.id,
                        ssrc = inbound.ssrc,
                        error = %e,
                        "Keyframe request failed"
                    ),
                }
            }
        }

        sent
    }

    /// Start the periodic dispatcher. It stops when `cancel` fires.
    pub fn spawn_keyframe_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config().keyframe_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Starting keyframe task");

            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.dispatch_keyframes().await;
                    }
                }
            }

            info!("Keyframe task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::registry::SessionEntry;
    use crate::test_helpers::{FakeEngine, FakeSignal, FakeStream};
    use crate::types::{SessionId, StreamId};
    use std::time::Duration;

    #[tokio::test]
    async fn test_one_request_per_contributed_stream() {
        let manager = SfuManager::new(FakeEngine::new(), SfuConfig::default());
        let a = manager.engine().detached_session();
        let b = manager.engine().detached_session();
        let c = manager.engine().detached_session();
        a.add_inbound("s1", 4242);
        for (id, media) in [("a", &a), ("b", &b), ("c", &c)] {
            manager
                .add_session(SessionEntry::new(SessionId::from(id), Arc::clone(media), FakeSignal::new()))
                .await;
        }
        manager
            .lock()
            .await
            .insert_stream(StreamId::from("s1"), Arc::new(FakeStream::new("s1")));
        manager.synchronize().await;
        for media in [&a, &b, &c] {
            media.reset_calls();
        }

        assert_eq!(manager.dispatch_keyframes().await, 1);

        assert_eq!(a.calls().picture_loss, vec![4242]);
        assert!(b.calls().picture_loss.is_empty());
        assert!(c.calls().picture_loss.is_empty());
    }

    #[tokio::test]
    async fn test_synchronize_dispatches_keyframes() {
        let manager = SfuManager::new(FakeEngine::new(), SfuConfig::default());
        let a = manager.engine().detached_session();
        a.add_inbound("audio", 1);
        a.add_inbound("video", 2);
        manager
            .add_session(SessionEntry::new(SessionId::from("a"), Arc::clone(&a), FakeSignal::new()))
            .await;

        manager.synchronize().await;

        assert_eq!(a.calls().picture_loss, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_cancelled() {
        let manager = SfuManager::new(FakeEngine::new(), SfuConfig::default());
        let a = manager.engine().detached_session();
        a.add_inbound("s1", 7);
        manager
            .add_session(SessionEntry::new(SessionId::from("a"), Arc::clone(&a), FakeSignal::new()))
            .await;

        let cancel = CancellationToken::new();
        let task = manager.spawn_keyframe_task(cancel.clone());

        tokio::time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(a.calls().picture_loss.len(), 2);

        cancel.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(a.calls().picture_loss.len(), 2);
    }
}
