use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionId;

/// Errors reported by the media engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("write on a stream with no active subscriber")]
    ClosedPipe,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("end of stream")]
    EndOfStream,

    #[error("WebRTC error: {0}")]
    WebRtc(webrtc::Error),

    #[error("Engine error: {0}")]
    Other(String),
}

/// Coarse classification of [`EngineError`], used to decide which
/// forwarding failures are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    ClosedPipe,
    ConnectionClosed,
    EndOfStream,
    WebRtc,
    Other,
}

impl EngineError {
    #[must_use]
    pub const fn kind(&self) -> EngineErrorKind {
        match self {
            Self::ClosedPipe => EngineErrorKind::ClosedPipe,
            Self::ConnectionClosed => EngineErrorKind::ConnectionClosed,
            Self::EndOfStream => EngineErrorKind::EndOfStream,
            Self::WebRtc(_) => EngineErrorKind::WebRtc,
            Self::Other(_) => EngineErrorKind::Other,
        }
    }
}

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrClosedPipe => Self::ClosedPipe,
            webrtc::Error::ErrConnectionClosed => Self::ConnectionClosed,
            other => Self::WebRtc(other),
        }
    }
}

/// Errors on the signaling channel
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Signaling channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A failed step of a synchronization attempt. Never leaves the retry loop.
#[derive(Error, Debug)]
pub enum RenegotiationError {
    #[error("Engine call failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Offer delivery failed: {0}")]
    Signal(#[from] SignalError),
}

/// Why a session ended abnormally
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session setup failed: {0}")]
    Setup(EngineError),

    #[error("Engine rejected signaling input: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error("Session already registered: {0}")]
    Duplicate(SessionId),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webrtc_error_mapping() {
        assert_eq!(
            EngineError::from(webrtc::Error::ErrClosedPipe).kind(),
            EngineErrorKind::ClosedPipe
        );
        assert_eq!(
            EngineError::from(webrtc::Error::ErrConnectionClosed).kind(),
            EngineErrorKind::ConnectionClosed
        );
        assert_eq!(
            EngineError::from(webrtc::Error::new("boom".to_string())).kind(),
            EngineErrorKind::WebRtc
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EngineErrorKind::ClosedPipe).unwrap();
        assert_eq!(json, "\"closed_pipe\"");
    }
}
