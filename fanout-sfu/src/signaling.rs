//! Signaling envelope and channel abstractions
//!
//! Every message on the wire is a JSON envelope `{"event": ..., "data": ...}`
//! where `data` is itself a JSON document serialized to a string: a session
//! description for `offer`/`answer`, an ICE candidate for `candidate`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SignalError;

pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_CANDIDATE: &str = "candidate";

/// Raw wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: String,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the browser `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Decoded signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalMessage {
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::Offer(_) => EVENT_OFFER,
            Self::Answer(_) => EVENT_ANSWER,
            Self::Candidate(_) => EVENT_CANDIDATE,
        }
    }

    /// Encode into the text form sent over the channel
    pub fn encode(&self) -> Result<String, SignalError> {
        let data = match self {
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_string(desc)?,
            Self::Candidate(candidate) => serde_json::to_string(candidate)?,
        };
        let envelope = Envelope {
            event: self.event().to_string(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode a text frame. `Ok(None)` means a well-formed envelope with an
    /// event this server does not handle.
    pub fn decode(text: &str) -> Result<Option<Self>, SignalError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let message = match envelope.event.as_str() {
            EVENT_OFFER => Self::Offer(serde_json::from_str(&envelope.data)?),
            EVENT_ANSWER => Self::Answer(serde_json::from_str(&envelope.data)?),
            EVENT_CANDIDATE => Self::Candidate(serde_json::from_str(&envelope.data)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Outbound half of a session's signaling channel.
///
/// Implementations must preserve ordering of messages sent through one sender.
#[async_trait]
pub trait SignalSender: Send + Sync + 'static {
    async fn send(&self, message: &SignalMessage) -> Result<(), SignalError>;

    /// Release the channel. Further sends fail.
    async fn close(&self);
}

/// Inbound half of a session's signaling channel
#[async_trait]
pub trait SignalReceiver: Send + 'static {
    /// Next text frame; `None` once the remote closed the channel
    async fn recv(&mut self) -> Option<Result<String, SignalError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_envelope_shape() {
        let text = SignalMessage::Offer(SessionDescription::offer("v=0\r\n"))
            .encode()
            .unwrap();
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.event, "offer");

        let desc: serde_json::Value = serde_json::from_str(&envelope.data).unwrap();
        assert_eq!(desc["type"], "offer");
        assert_eq!(desc["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_decode_browser_candidate() {
        let text = r#"{"event":"candidate","data":"{\"candidate\":\"candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host\",\"sdpMid\":\"0\",\"sdpMLineIndex\":0,\"usernameFragment\":\"abcd\"}"}"#;
        let message = SignalMessage::decode(text).unwrap().unwrap();
        match message {
            SignalMessage::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_answer() {
        let text = r#"{"event":"answer","data":"{\"type\":\"answer\",\"sdp\":\"v=0\"}"}"#;
        assert_eq!(
            SignalMessage::decode(text).unwrap(),
            Some(SignalMessage::Answer(SessionDescription::answer("v=0")))
        );
    }

    #[test]
    fn test_unknown_event_is_skipped() {
        let text = r#"{"event":"bye","data":""}"#;
        assert_eq!(SignalMessage::decode(text).unwrap(), None);
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        assert!(SignalMessage::decode("not json").is_err());
        assert!(SignalMessage::decode(r#"{"event":"answer","data":"{}"}"#).is_err());
    }
}
