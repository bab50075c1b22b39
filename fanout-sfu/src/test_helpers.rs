//! Test helpers and fixtures for fanout-sfu tests
//!
//! An in-memory media engine that records every call the SFU makes and lets
//! tests inject failures, plus signaling channel fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::engine::{
    EventSender, InboundInfo, LocalStream, MediaEngine, MediaSession, RemoteStream, SessionEvent,
    Subscription,
};
use crate::error::{EngineError, Result, SignalError};
use crate::signaling::{IceCandidate, SessionDescription, SignalMessage, SignalReceiver, SignalSender};
use crate::types::{ConnectionState, MediaKind, StreamId};

/// Packets carried by the fake engine
pub type FakePacket = u32;

/// Fake engine. Every session it creates is kept so tests can inspect it.
#[derive(Default)]
pub struct FakeEngine {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    fail_create: AtomicBool,
    gauge: Arc<OfferGauge>,
}

/// Tracks how many `create_offer` calls run at the same time
#[derive(Default)]
pub struct OfferGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl OfferGauge {
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_session` calls fail
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Sessions created so far, in creation order
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    #[must_use]
    pub fn gauge(&self) -> Arc<OfferGauge> {
        Arc::clone(&self.gauge)
    }

    /// A session that is not wired to any event channel
    #[must_use]
    pub fn detached_session(&self) -> Arc<FakeSession> {
        let session = Arc::new(FakeSession::new(None, Arc::clone(&self.gauge)));
        self.sessions.lock().push(Arc::clone(&session));
        session
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    type Remote = FakeRemote;
    type Session = FakeSession;

    async fn create_session(&self, events: EventSender<FakeRemote>) -> Result<Arc<FakeSession>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Other("transceiver setup rejected".to_string()));
        }
        let session = Arc::new(FakeSession::new(Some(events), Arc::clone(&self.gauge)));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Everything the SFU did to one fake session
#[derive(Debug, Default, Clone)]
pub struct SessionCalls {
    pub subscribed: Vec<StreamId>,
    pub unsubscribed: Vec<StreamId>,
    pub offers_created: usize,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
    pub picture_loss: Vec<u32>,
    pub closes: usize,
}

/// Fake engine session
pub struct FakeSession {
    state: Mutex<ConnectionState>,
    outbound: Mutex<Vec<StreamId>>,
    inbound: Mutex<Vec<InboundInfo>>,
    calls: Mutex<SessionCalls>,
    fail_subscribe: AtomicUsize,
    fail_offer: AtomicUsize,
    events: Option<EventSender<FakeRemote>>,
    gauge: Arc<OfferGauge>,
}

impl FakeSession {
    fn new(events: Option<EventSender<FakeRemote>>, gauge: Arc<OfferGauge>) -> Self {
        Self {
            state: Mutex::new(ConnectionState::New),
            outbound: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            calls: Mutex::new(SessionCalls::default()),
            fail_subscribe: AtomicUsize::new(0),
            fail_offer: AtomicUsize::new(0),
            events,
            gauge,
        }
    }

    #[must_use]
    pub fn calls(&self) -> SessionCalls {
        self.calls.lock().clone()
    }

    /// Forget recorded calls (state is kept)
    pub fn reset_calls(&self) {
        *self.calls.lock() = SessionCalls::default();
    }

    /// Stream IDs currently sent toward this participant, sorted
    #[must_use]
    pub fn outbound(&self) -> Vec<StreamId> {
        let mut ids = self.outbound.lock().clone();
        ids.sort();
        ids
    }

    /// Record an inbound contribution as the engine would after negotiation
    pub fn add_inbound(&self, stream_id: &str, ssrc: u32) {
        self.inbound.lock().push(InboundInfo {
            stream_id: StreamId::from(stream_id),
            ssrc,
        });
    }

    /// Fail the next `n` subscribe calls
    pub fn fail_next_subscribes(&self, n: usize) {
        self.fail_subscribe.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` create_offer calls
    pub fn fail_next_offers(&self, n: usize) {
        self.fail_offer.store(n, Ordering::SeqCst);
    }

    /// Change state and emit the matching event
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    /// Push an arbitrary event into the session's event channel
    pub fn emit(&self, event: SessionEvent<FakeRemote>) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    type Local = FakeStream;
    type Handle = StreamId;

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn outbound_subscriptions(&self) -> Vec<Subscription<StreamId>> {
        self.outbound
            .lock()
            .iter()
            .map(|id| Subscription {
                stream_id: id.clone(),
                handle: id.clone(),
            })
            .collect()
    }

    async fn inbound_streams(&self) -> Vec<InboundInfo> {
        self.inbound.lock().clone()
    }

    async fn subscribe(&self, stream: &Arc<FakeStream>) -> Result<()> {
        if Self::take_failure(&self.fail_subscribe) {
            return Err(EngineError::Other("subscribe rejected".to_string()));
        }
        self.outbound.lock().push(stream.id().clone());
        self.calls.lock().subscribed.push(stream.id().clone());
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription<StreamId>) -> Result<()> {
        self.outbound.lock().retain(|id| id != &subscription.handle);
        self.calls.lock().unsubscribed.push(subscription.stream_id.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let current = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.max.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().offers_created += 1;
        if Self::take_failure(&self.fail_offer) {
            return Err(EngineError::Other("offer rejected".to_string()));
        }
        let streams: Vec<String> = self.outbound().iter().map(ToString::to_string).collect();
        Ok(SessionDescription::offer(format!("streams={}", streams.join(","))))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.calls.lock().local_descriptions.push(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.calls.lock().remote_descriptions.push(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.calls.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn send_picture_loss(&self, media_ssrc: u32) -> Result<()> {
        self.calls.lock().picture_loss.push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().closes += 1;
        let already_closed = {
            let mut state = self.state.lock();
            let closed = *state == ConnectionState::Closed;
            *state = ConnectionState::Closed;
            closed
        };
        if !already_closed {
            self.emit(SessionEvent::StateChanged(ConnectionState::Closed));
        }
        Ok(())
    }
}

/// Fake distribution stream. Clones share state.
#[derive(Clone)]
pub struct FakeStream {
    id: StreamId,
    written: Arc<Mutex<Vec<FakePacket>>>,
    write_attempts: Arc<AtomicUsize>,
    write_error: Arc<Mutex<Option<fn() -> EngineError>>>,
}

impl FakeStream {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: StreamId::from(id),
            written: Arc::new(Mutex::new(Vec::new())),
            write_attempts: Arc::new(AtomicUsize::new(0)),
            write_error: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn written(&self) -> Vec<FakePacket> {
        self.written.lock().clone()
    }

    /// Writes attempted, including failed ones
    #[must_use]
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Make every write fail with the error built by `make`
    pub fn fail_writes(&self, make: fn() -> EngineError) {
        *self.write_error.lock() = Some(make);
    }
}

#[async_trait]
impl LocalStream for FakeStream {
    type Packet = FakePacket;

    fn id(&self) -> &StreamId {
        &self.id
    }

    async fn write_packet(&self, packet: &FakePacket) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let write_error = *self.write_error.lock();
        if let Some(make) = write_error {
            return Err(make());
        }
        self.written.lock().push(*packet);
        Ok(())
    }
}

/// Fake inbound stream fed through a [`FakeFeed`]
pub struct FakeRemote {
    id: StreamId,
    ssrc: u32,
    published: FakeStream,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakePacket>>,
}

/// Producer side of a [`FakeRemote`]; dropping it ends the stream
pub struct FakeFeed {
    tx: mpsc::UnboundedSender<FakePacket>,
}

impl FakeFeed {
    pub fn push(&self, packet: FakePacket) {
        let _ = self.tx.send(packet);
    }
}

impl FakeRemote {
    /// Returns the remote, its feed, and a handle to the stream `publish`
    /// will produce
    #[must_use]
    pub fn new(id: &str, ssrc: u32) -> (Self, FakeFeed, FakeStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let published = FakeStream::new(id);
        let remote = Self {
            id: StreamId::from(id),
            ssrc,
            published: published.clone(),
            packets: tokio::sync::Mutex::new(rx),
        };
        (remote, FakeFeed { tx }, published)
    }
}

#[async_trait]
impl RemoteStream for FakeRemote {
    type Packet = FakePacket;
    type Local = FakeStream;

    fn id(&self) -> StreamId {
        self.id.clone()
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn publish(&self) -> Result<FakeStream> {
        Ok(self.published.clone())
    }

    async fn read_packet(&self) -> Result<FakePacket> {
        self.packets.lock().await.recv().await.ok_or(EngineError::EndOfStream)
    }
}

/// Fake outbound signaling channel
#[derive(Default)]
pub struct FakeSignal {
    sent: Mutex<Vec<SignalMessage>>,
    fail_sends: AtomicUsize,
    closed: AtomicBool,
}

impl FakeSignal {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    /// Offers sent so far
    #[must_use]
    pub fn offers(&self) -> Vec<SessionDescription> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                SignalMessage::Offer(desc) => Some(desc.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Fail the next `n` sends
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalSender for FakeSignal {
    async fn send(&self, message: &SignalMessage) -> std::result::Result<(), SignalError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalError::Closed);
        }
        if FakeSession::take_failure(&self.fail_sends) {
            return Err(SignalError::Transport("write failed".to_string()));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fake inbound signaling channel, fed by a [`FakeInbox`]
pub struct FakeReceiver {
    rx: mpsc::UnboundedReceiver<std::result::Result<String, SignalError>>,
}

/// Producer side of a [`FakeReceiver`]; dropping it closes the channel
#[derive(Clone)]
pub struct FakeInbox {
    tx: mpsc::UnboundedSender<std::result::Result<String, SignalError>>,
}

impl FakeInbox {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(Ok(text.into()));
    }

    pub fn push_message(&self, message: &SignalMessage) {
        if let Ok(text) = message.encode() {
            self.push_text(text);
        }
    }

    pub fn push_error(&self, err: SignalError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Build a connected inbox/receiver pair
#[must_use]
pub fn fake_channel() -> (FakeInbox, FakeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FakeInbox { tx }, FakeReceiver { rx })
}

#[async_trait]
impl SignalReceiver for FakeReceiver {
    async fn recv(&mut self) -> Option<std::result::Result<String, SignalError>> {
        self.rx.recv().await
    }
}

/// Poll `condition` until it holds. Panics after five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
