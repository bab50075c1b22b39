//! End-to-end convergence scenarios driven through `serve_session` with the
//! in-memory engine.

use std::sync::Arc;
use tokio::task::JoinHandle;

use fanout_sfu::test_helpers::{
    eventually, fake_channel, FakeEngine, FakeFeed, FakeInbox, FakeRemote, FakeSession, FakeSignal,
};
use fanout_sfu::{
    ConnectionState, MediaSession, SessionError, SessionEvent, SfuConfig, SfuManager, SfuStats,
    SignalSender, StreamId,
};

type Manager = Arc<SfuManager<FakeEngine>>;

struct Participant {
    media: Arc<FakeSession>,
    signal: Arc<FakeSignal>,
    inbox: FakeInbox,
    task: JoinHandle<Result<(), SessionError>>,
}

fn manager() -> Manager {
    SfuManager::new(FakeEngine::new(), SfuConfig::default())
}

async fn join(manager: &Manager) -> Participant {
    let index = manager.engine().sessions().len();
    let signal = FakeSignal::new();
    let (inbox, receiver) = fake_channel();

    let task = {
        let manager = Arc::clone(manager);
        let signal: Arc<dyn SignalSender> = signal.clone();
        tokio::spawn(async move { manager.serve_session(signal, receiver).await })
    };

    eventually("session creation", || manager.engine().sessions().len() > index).await;
    let media = Arc::clone(&manager.engine().sessions()[index]);
    eventually("initial offer", || !signal.offers().is_empty()).await;

    Participant {
        media,
        signal,
        inbox,
        task,
    }
}

/// Start contributing a stream the way the engine reports one
fn contribute(participant: &Participant, id: &str, ssrc: u32) -> FakeFeed {
    participant.media.add_inbound(id, ssrc);
    let (remote, feed, _published) = FakeRemote::new(id, ssrc);
    participant.media.emit(SessionEvent::InboundStream(remote));
    feed
}

fn ids(names: &[&str]) -> Vec<StreamId> {
    names.iter().map(|name| StreamId::from(*name)).collect()
}

fn last_offer(participant: &Participant) -> Option<String> {
    participant.signal.offers().last().map(|offer| offer.sdp.clone())
}

#[tokio::test]
async fn test_lone_participant_gets_empty_offer() {
    let manager = manager();
    let a = join(&manager).await;

    assert_eq!(a.signal.offers().len(), 1);
    assert_eq!(last_offer(&a).as_deref(), Some("streams="));
    assert!(a.media.calls().subscribed.is_empty());
}

#[tokio::test]
async fn test_streams_fan_out_to_every_other_participant() {
    let manager = manager();
    let a = join(&manager).await;
    let _a_feed = contribute(&a, "a-video", 1);

    let b = join(&manager).await;
    eventually("b subscribed", || b.media.outbound() == ids(&["a-video"])).await;

    let c = join(&manager).await;
    let _c_feed = contribute(&c, "c-video", 3);

    eventually("fan-out converged", || {
        a.media.outbound() == ids(&["c-video"])
            && b.media.outbound() == ids(&["a-video", "c-video"])
            && c.media.outbound() == ids(&["a-video"])
    })
    .await;
    eventually("b offer lists both streams", || {
        last_offer(&b).as_deref() == Some("streams=a-video,c-video")
    })
    .await;

    assert_eq!(
        manager.stats().await,
        SfuStats {
            sessions: 3,
            streams: 2
        }
    );
}

#[tokio::test]
async fn test_departing_participant_is_unsubscribed_everywhere() {
    let manager = manager();
    let a = join(&manager).await;
    let a_feed = contribute(&a, "a-video", 1);
    let b = join(&manager).await;
    let c = join(&manager).await;
    eventually("subscribed", || {
        b.media.outbound() == ids(&["a-video"]) && c.media.outbound() == ids(&["a-video"])
    })
    .await;
    b.signal.clear();
    c.signal.clear();

    drop(a.inbox);
    drop(a_feed);
    assert!(a.task.await.unwrap().is_ok());
    assert!(a.signal.is_closed());

    eventually("unsubscribed", || {
        b.media.outbound().is_empty() && c.media.outbound().is_empty()
    })
    .await;
    for participant in [&b, &c] {
        assert_eq!(participant.media.calls().unsubscribed, ids(&["a-video"]));
        eventually("empty offer", || {
            last_offer(participant).as_deref() == Some("streams=")
        })
        .await;
    }

    assert_eq!(
        manager.stats().await,
        SfuStats {
            sessions: 2,
            streams: 0
        }
    );
}

#[tokio::test]
async fn test_failed_participant_is_closed_and_removed() {
    let manager = manager();
    let a = join(&manager).await;
    let b = join(&manager).await;

    b.media.set_state(ConnectionState::Failed);

    assert!(b.task.await.unwrap().is_ok());
    assert_eq!(b.media.connection_state(), ConnectionState::Closed);
    assert!(b.signal.is_closed());
    assert_eq!(manager.stats().await.sessions, 1);
    assert!(!a.task.is_finished());
}

#[tokio::test]
async fn test_keyframe_request_once_per_contributed_stream() {
    let manager = manager();
    let a = join(&manager).await;
    let _a_feed = contribute(&a, "a-video", 42);
    let b = join(&manager).await;
    let c = join(&manager).await;
    eventually("subscribed", || {
        b.media.outbound() == ids(&["a-video"]) && c.media.outbound() == ids(&["a-video"])
    })
    .await;

    assert_eq!(manager.dispatch_keyframes().await, 1);
    let requests = a.media.calls().picture_loss;
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|ssrc| *ssrc == 42));
    assert!(b.media.calls().picture_loss.is_empty());
    assert!(c.media.calls().picture_loss.is_empty());
}

#[tokio::test]
async fn test_shutdown_ends_every_session() {
    let manager = manager();
    let a = join(&manager).await;
    let b = join(&manager).await;

    manager.shutdown().await;

    assert!(a.task.await.unwrap().is_ok());
    assert!(b.task.await.unwrap().is_ok());
    assert_eq!(manager.stats().await, SfuStats::default());
}
