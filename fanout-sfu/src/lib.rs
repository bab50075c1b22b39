//! Fanout SFU (Selective Forwarding Unit)
//!
//! This crate implements a WebRTC SFU: every participant opens one session,
//! every stream a participant sends is re-published to every other
//! participant, and each session's description is renegotiated as
//! participants join, leave, or fail.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: Owns the session and stream registries behind one lock
//! - **Synchronizer**: Converges every session's subscriptions onto the stream
//!   registry with a bounded retry loop and a deferred retry
//! - **Keyframe dispatcher**: Periodic picture loss indications toward every
//!   contributing participant
//! - **Session lifecycle**: Drives one participant from signaling channel to
//!   teardown
//! - **`MediaEngine`**: Abstraction over the WebRTC stack, implemented by
//!   `RtcEngine` on top of the `webrtc` crate
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fanout_sfu::{RtcEngine, SfuConfig, SfuManager};
//!
//! let config = SfuConfig::default();
//! let manager = SfuManager::new(RtcEngine::new(config.rtc.clone()), config);
//! let keyframes = manager.spawn_keyframe_task(cancel.clone());
//!
//! // per accepted signaling channel
//! manager.serve_session(signal, receiver).await?;
//! ```

mod config;
mod engine;
mod error;
mod forward;
mod keyframe;
mod manager;
mod registry;
mod rtc;
mod session;
mod signaling;
mod sync;
mod types;

pub mod test_helpers;

pub use config::{RtcConfig, SfuConfig};
pub use engine::{
    EventReceiver, EventSender, InboundInfo, LocalOf, LocalStream, MediaEngine, MediaSession,
    RemoteStream, SessionEvent, Subscription,
};
pub use error::{EngineError, EngineErrorKind, RenegotiationError, Result, SessionError, SignalError};
pub use manager::{SfuManager, SfuStats};
pub use registry::SessionEntry;
pub use rtc::{RtcEngine, RtcLocalStream, RtcRemoteStream, RtcSession};
pub use signaling::{
    Envelope, IceCandidate, SdpType, SessionDescription, SignalMessage, SignalReceiver,
    SignalSender, EVENT_ANSWER, EVENT_CANDIDATE, EVENT_OFFER,
};
pub use sync::SyncOutcome;
pub use types::{ConnectionState, MediaKind, SessionId, StreamId};
