//! Media engine backed by the `webrtc` crate
//!
//! Every session gets its own API instance with the default codecs and
//! interceptors, one receive-only audio and one receive-only video
//! transceiver, and callbacks that only forward into the session's event
//! channel.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::RtcConfig;
use crate::engine::{
    EventSender, InboundInfo, LocalStream, MediaEngine, MediaSession, RemoteStream, SessionEvent,
    Subscription,
};
use crate::error::{EngineError, Result};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::types::{ConnectionState, MediaKind, StreamId};

/// RTCP read buffer, one MTU
const RTCP_BUFFER_SIZE: usize = 1500;

/// `webrtc` engine
pub struct RtcEngine {
    config: RtcConfig,
}

impl RtcEngine {
    #[must_use]
    pub const fn new(config: RtcConfig) -> Self {
        Self { config }
    }

    fn build_api(&self) -> Result<API> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)?;

        let mut settings = SettingEngine::default();
        if self.config.udp_port_min > 0 && self.config.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(self.config.udp_port_min, self.config.udp_port_max)
                .map_err(|e| EngineError::Other(format!("invalid UDP port range: {e}")))?;
            settings.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        settings.set_network_types(vec![NetworkType::Udp4, NetworkType::Udp6]);

        Ok(APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    type Remote = RtcRemoteStream;
    type Session = RtcSession;

    async fn create_session(&self, events: EventSender<RtcRemoteStream>) -> Result<Arc<RtcSession>> {
        let api = self.build_api()?;
        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration()).await?);

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            if let Err(e) = pc.add_transceiver_from_kind(kind, Some(init)).await {
                if let Err(close_err) = pc.close().await {
                    warn!(error = %close_err, "Failed to close half-built peer connection");
                }
                return Err(e.into());
            }
        }

        wire_events(&pc, &events);
        Ok(Arc::new(RtcSession { pc }))
    }
}

/// Register the peer connection callbacks. Each one only pushes an event.
fn wire_events(pc: &RTCPeerConnection, events: &EventSender<RtcRemoteStream>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(SessionEvent::Candidate(init.into()));
                }
                Err(e) => debug!(error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(SessionEvent::StateChanged(state.into()));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let _ = tx.send(SessionEvent::InboundStream(RtcRemoteStream { track }));
        Box::pin(async {})
    }));
}

/// A participant's peer connection
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for RtcSession {
    type Local = RtcLocalStream;
    type Handle = Arc<RTCRtpSender>;

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    async fn outbound_subscriptions(&self) -> Vec<Subscription<Arc<RTCRtpSender>>> {
        let mut subscriptions = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                subscriptions.push(Subscription {
                    stream_id: StreamId::from(track.id()),
                    handle: sender,
                });
            }
        }
        subscriptions
    }

    async fn inbound_streams(&self) -> Vec<InboundInfo> {
        let mut inbound = Vec::new();
        for receiver in self.pc.get_receivers().await {
            for track in receiver.tracks().await {
                let stream_id = track.id();
                if stream_id.is_empty() {
                    continue;
                }
                inbound.push(InboundInfo {
                    stream_id: StreamId::from(stream_id),
                    ssrc: track.ssrc(),
                });
            }
        }
        inbound
    }

    async fn subscribe(&self, stream: &Arc<RtcLocalStream>) -> Result<()> {
        let track = Arc::clone(&stream.track) as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self.pc.add_track(track).await?;

        // Interceptors only run while RTCP is being read
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription<Arc<RTCRtpSender>>) -> Result<()> {
        self.pc.remove_track(&subscription.handle).await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn send_picture_loss(&self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.pc.write_rtcp(&[Box::new(pli)]).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Track a participant is sending to us
pub struct RtcRemoteStream {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteStream for RtcRemoteStream {
    type Packet = Packet;
    type Local = RtcLocalStream;

    fn id(&self) -> StreamId {
        StreamId::from(self.track.id())
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn kind(&self) -> MediaKind {
        self.track.kind().into()
    }

    fn publish(&self) -> Result<RtcLocalStream> {
        Ok(RtcLocalStream::new(
            self.track.codec().capability,
            self.track.id(),
            self.track.stream_id(),
        ))
    }

    async fn read_packet(&self) -> Result<Packet> {
        let (packet, _attributes) = self.track.read_rtp().await?;
        Ok(packet)
    }
}

/// Distribution copy of an inbound track
pub struct RtcLocalStream {
    id: StreamId,
    track: Arc<TrackLocalStaticRTP>,
}

impl RtcLocalStream {
    /// Local track with the inbound track's codec and identifiers
    fn new(codec: RTCRtpCodecCapability, id: String, stream_id: String) -> Self {
        Self {
            id: StreamId::from(id.as_str()),
            track: Arc::new(TrackLocalStaticRTP::new(codec, id, stream_id)),
        }
    }
}

#[async_trait]
impl LocalStream for RtcLocalStream {
    type Packet = Packet;

    fn id(&self) -> &StreamId {
        &self.id
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.track
            .write_rtp(packet)
            .await
            .map_err(classify_write_error)?;
        Ok(())
    }
}

/// `TrackLocalStaticRTP` joins the failures of every subscriber into one
/// newline-separated message. It only counts as a closed pipe when every
/// subscriber reported one.
fn classify_write_error(err: webrtc::Error) -> EngineError {
    if let webrtc::Error::new(message) = &err {
        let closed_pipe = webrtc::Error::ErrClosedPipe.to_string();
        if !message.is_empty() && message.split('\n').all(|part| part == closed_pipe) {
            return EngineError::ClosedPipe;
        }
    }
    err.into()
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

impl From<RTPCodecType> for MediaKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            return Err(EngineError::Other(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(EngineError::Other(
                "engine produced a description without a type".to_string(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}
