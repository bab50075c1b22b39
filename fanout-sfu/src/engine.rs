//! Media engine abstraction
//!
//! The SFU core never talks to ICE/DTLS/SRTP directly. It drives sessions
//! through these traits; [`crate::rtc`] implements them on top of the
//! `webrtc` crate and [`crate::test_helpers`] provides an in-memory fake.
//!
//! Engine callbacks are delivered as [`SessionEvent`] values on a per-session
//! channel instead of closures, so no callback ever holds shared state.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::types::{ConnectionState, MediaKind, StreamId};

/// Events emitted by an engine session
#[derive(Debug)]
pub enum SessionEvent<R> {
    /// A local ICE candidate was gathered (trickle ICE)
    Candidate(IceCandidate),
    /// The connection moved to a new state
    StateChanged(ConnectionState),
    /// The remote started sending a new stream
    InboundStream(R),
}

pub type EventSender<R> = mpsc::UnboundedSender<SessionEvent<R>>;
pub type EventReceiver<R> = mpsc::UnboundedReceiver<SessionEvent<R>>;

/// One stream the remote participant is sending to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundInfo {
    pub stream_id: StreamId,
    /// Media source identifier, target of keyframe requests
    pub ssrc: u32,
}

/// One stream we are currently sending to the remote participant
#[derive(Debug, Clone)]
pub struct Subscription<H> {
    pub stream_id: StreamId,
    pub handle: H,
}

/// Factory for engine sessions
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    type Remote: RemoteStream;
    type Session: MediaSession<Local = <Self::Remote as RemoteStream>::Local>;

    /// Create a session that receives one audio and one video stream and
    /// reports its callbacks on `events`
    async fn create_session(
        &self,
        events: EventSender<Self::Remote>,
    ) -> Result<Arc<Self::Session>>;
}

/// A participant's connection inside the engine
#[async_trait]
pub trait MediaSession: Send + Sync + 'static {
    type Local: LocalStream;
    type Handle: Send + Sync + 'static;

    fn connection_state(&self) -> ConnectionState;

    /// Streams currently being sent toward the participant
    async fn outbound_subscriptions(&self) -> Vec<Subscription<Self::Handle>>;

    /// Streams the participant is currently contributing
    async fn inbound_streams(&self) -> Vec<InboundInfo>;

    async fn subscribe(&self, stream: &Arc<Self::Local>) -> Result<()>;

    async fn unsubscribe(&self, subscription: &Subscription<Self::Handle>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Ask the sender of `media_ssrc` for a fresh keyframe
    async fn send_picture_loss(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// An inbound stream as delivered by the engine
#[async_trait]
pub trait RemoteStream: Send + Sync + 'static {
    type Packet: Send + Sync + 'static;
    type Local: LocalStream<Packet = Self::Packet>;

    fn id(&self) -> StreamId;

    fn ssrc(&self) -> u32;

    fn kind(&self) -> MediaKind;

    /// Create the distribution copy: same codec, same identifier
    fn publish(&self) -> Result<Self::Local>;

    async fn read_packet(&self) -> Result<Self::Packet>;
}

/// A distribution-ready stream other sessions can subscribe to
#[async_trait]
pub trait LocalStream: Send + Sync + 'static {
    type Packet: Send + Sync + 'static;

    fn id(&self) -> &StreamId;

    async fn write_packet(&self, packet: &Self::Packet) -> Result<()>;
}

/// Local stream type of an engine
pub type LocalOf<E> = <<E as MediaEngine>::Remote as RemoteStream>::Local;
