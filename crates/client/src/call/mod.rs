//! One-to-one call negotiation.
//!
//! - [`state`]: the pure transition function over [`NegotiationSession`]
//! - [`negotiator`]: the async driver that executes transition effects
//! - [`peer`]: peer-connection and media adapter contracts
//! - [`webrtc`]: the webrtc-rs implementation of those contracts
//! - `testing`: scripted adapters, built for tests and the `test-util` feature

pub mod negotiator;
pub mod peer;
pub mod state;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod webrtc;

use std::fmt;

use protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while driving a negotiation.
#[derive(Debug, Error)]
pub enum CallError {
    /// The user or platform refused camera/microphone access.
    #[error("media permission denied")]
    MediaPermissionDenied,

    /// The peer connection rejected an operation.
    #[error("peer connection failure: {0}")]
    PeerConnection(String),

    /// An SDP payload could not be parsed.
    #[error("invalid session description: {0}")]
    InvalidSdp(String),

    /// An ICE candidate payload could not be parsed.
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Sending a signal failed.
    #[error("signal transport failed: {0}")]
    Transport(#[from] ProtocolError),
}

/// Negotiation state of the local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallState {
    /// No negotiation in progress.
    #[default]
    Idle,
    /// We asked a peer for a call and wait for consent.
    Requesting,
    /// A peer asked us for a call and the user has not answered.
    Thinking,
    /// The peer consented; we create and send the offer.
    Offering,
    /// We consented and wait for the peer's offer.
    WaitOffering,
    /// Descriptions exchanged; media flows once ICE connects.
    Communicating,
}

impl CallState {
    /// Whether a peer connection exists in this state.
    pub fn has_peer_connection(self) -> bool {
        matches!(
            self,
            CallState::Offering | CallState::WaitOffering | CallState::Communicating
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Requesting => "requesting",
            CallState::Thinking => "thinking",
            CallState::Offering => "offering",
            CallState::WaitOffering => "wait-offering",
            CallState::Communicating => "communicating",
        };
        f.write_str(name)
    }
}

/// User-facing outcome of a negotiation that ended without a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Local media could not be acquired.
    PermissionDenied,
    /// The peer declined.
    PeerDenied,
    /// The peer is in another negotiation.
    PeerBusy,
    /// The peer hung up or went offline.
    HungUp,
    /// The peer never answered our request.
    TimedOut,
    /// The peer connection failed.
    CallFailed(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::PermissionDenied => f.write_str("camera or microphone permission denied"),
            Notification::PeerDenied => f.write_str("the peer declined the call"),
            Notification::PeerBusy => f.write_str("the peer is busy"),
            Notification::HungUp => f.write_str("the call ended"),
            Notification::TimedOut => f.write_str("the peer did not answer"),
            Notification::CallFailed(reason) => write!(f, "the call failed: {reason}"),
        }
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

pub use negotiator::{CallNegotiator, NegotiatorHandle, SessionSnapshot, SignalSink};
pub use peer::{MediaSource, MediaStream, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvents};
pub use state::{transition, Effect, NegotiationSession, Trigger};
