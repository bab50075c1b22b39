//! Inbound stream forwarding
//!
//! Each accepted inbound stream gets a distribution copy in the stream
//! registry and a dedicated read loop copying packets into it. The copy is
//! withdrawn when the loop ends.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{LocalStream, MediaEngine, RemoteStream};
use crate::manager::SfuManager;
use crate::types::SessionId;

impl<E: MediaEngine> SfuManager<E> {
    /// Publish `remote` for fan-out and forward its packets until it ends
    pub async fn forward_stream(self: Arc<Self>, owner: SessionId, remote: E::Remote) {
        let stream_id = remote.id();
        let local = match remote.publish() {
            Ok(local) => Arc::new(local),
            Err(e) => {
                warn!(
                    session_id = %owner,
                    stream_id = %stream_id,
                    error = %e,
                    "Failed to create distribution stream"
                );
                return;
            }
        };

        info!(
            session_id = %owner,
            stream_id = %stream_id,
            kind = ?remote.kind(),
            ssrc = remote.ssrc(),
            "Forwarding inbound stream"
        );
        self.publish_stream(Arc::clone(&local)).await;

        let mut forwarded: u64 = 0;
        loop {
            let packet = match remote.read_packet().await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(stream_id = %stream_id, error = %e, "Inbound stream ended");
                    break;
                }
            };

            match local.write_packet(&packet).await {
                Ok(()) => forwarded += 1,
                Err(e) if self.config().is_benign_forward_error(&e) => {}
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "Failed to forward packet");
                    break;
                }
            }
        }

        self.unpublish_stream(&local).await;
        info!(
            session_id = %owner,
            stream_id = %stream_id,
            forwarded,
            "Stopped forwarding stream"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::error::{EngineError, EngineErrorKind};
    use crate::test_helpers::{eventually, FakeEngine, FakeRemote};
    use crate::types::StreamId;

    async fn has_stream(manager: &SfuManager<FakeEngine>, id: &str) -> bool {
        manager.stream_ids().await.contains(&StreamId::from(id))
    }

    #[tokio::test]
    async fn test_packets_forwarded_until_stream_ends() {
        let manager = SfuManager::new(FakeEngine::new(), SfuConfig::default());
        let (remote, feed, published) = FakeRemote::new("s1", 1);
        let task = tokio::spawn(Arc::clone(&manager).forward_stream(SessionId::from("a"), remote));

        for packet in [10, 11, 12] {
            feed.push(packet);
        }
        eventually("packets written", || published.written().len() == 3).await;
        assert!(has_stream(&manager, "s1").await);

        drop(feed);
        task.await.unwrap();

        assert_eq!(published.written(), vec![10, 11, 12]);
        assert!(!has_stream(&manager, "s1").await);
    }

    #[tokio::test]
    async fn test_benign_write_error_keeps_forwarding() {
        let manager = SfuManager::new(FakeEngine::new(), SfuConfig::default());
        let (remote, feed, published) = FakeRemote::new("s1", 1);
        published.fail_writes(|| EngineError::ClosedPipe);
        let task = tokio::spawn(Arc::clone(&manager).forward_stream(SessionId::from("a"), remote));

        for packet in [1, 2, 3] {
            feed.push(packet);
        }
        eventually("write attempts", || published.write_attempts() == 3).await;
        assert!(has_stream(&manager, "s1").await);
        assert!(!task.is_finished());

        drop(feed);
        task.await.unwrap();
        assert!(!has_stream(&manager, "s1").await);
    }

    #[tokio::test]
    async fn test_other_write_error_ends_forwarding() {
        let manager = SfuManager::new(FakeEngine::new(), SfuConfig::default());
        let (remote, feed, published) = FakeRemote::new("s1", 1);
        published.fail_writes(|| EngineError::ConnectionClosed);
        let task = tokio::spawn(Arc::clone(&manager).forward_stream(SessionId::from("a"), remote));

        feed.push(1);
        task.await.unwrap();

        assert_eq!(published.write_attempts(), 1);
        assert!(!has_stream(&manager, "s1").await);
    }

    #[tokio::test]
    async fn test_benign_set_is_configurable() {
        let config = SfuConfig {
            benign_forward_errors: vec![EngineErrorKind::ConnectionClosed],
            ..Default::default()
        };
        let manager = SfuManager::new(FakeEngine::new(), config);
        let (remote, feed, published) = FakeRemote::new("s1", 1);
        published.fail_writes(|| EngineError::ClosedPipe);
        let task = tokio::spawn(Arc::clone(&manager).forward_stream(SessionId::from("a"), remote));

        feed.push(1);
        feed.push(2);
        task.await.unwrap();

        // closed_pipe is no longer tolerated
        assert_eq!(published.write_attempts(), 1);
    }
}
