//! Peer-connection and media adapter contracts.
//!
//! The negotiator never touches webrtc-rs directly. It drives these traits,
//! so the same state machine runs against [`super::webrtc`] in the binary and
//! against the scripted adapters in `call::testing` in tests.
//!
//! Session descriptions and ICE candidates cross these traits as the JSON
//! strings carried in signal values.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::negotiator::Input;
use super::state::Trigger;
use super::{CallError, TrackKind};

/// One local media track.
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    fn id(&self) -> &str;

    /// Stop capturing. Idempotent.
    fn stop(&self);

    /// Access to the concrete track for the adapter that created it.
    fn as_any(&self) -> &dyn Any;
}

/// Local media acquired for one call.
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stop every track of the stream.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Source of local camera and microphone media.
pub trait MediaSource: Send + Sync {
    /// Acquire audio and video.
    ///
    /// Returns [`CallError::MediaPermissionDenied`] when capture is refused.
    fn acquire<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MediaStream, CallError>> + Send + 'a>>;
}

/// A single peer connection.
pub trait PeerConnection: Send + Sync {
    /// Create an offer and return its SDP JSON.
    fn create_offer<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>>;

    /// Create an answer and return its SDP JSON.
    fn create_answer<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>>;

    fn set_local_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;

    fn set_remote_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;

    /// Attach every track of the stream.
    fn add_media<'a>(
        &'a self,
        stream: &'a MediaStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;

    /// Whether the signaling state is stable.
    fn is_stable(&self) -> bool;

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;
}

/// Creates peer connections for the negotiator.
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection whose callbacks report through `events`.
    fn create<'a>(
        &'a self,
        events: PeerEvents,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerConnection>, CallError>> + Send + 'a>>;
}

/// Callback sink handed to a peer connection.
///
/// Every event is stamped with the generation of the negotiation that created
/// the connection, so events from a released connection are ignored.
#[derive(Clone)]
pub struct PeerEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl PeerEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A local ICE candidate was gathered.
    pub fn ice_candidate(&self, candidate: String) {
        self.post(Trigger::LocalCandidate {
            generation: self.generation,
            candidate,
        });
    }

    /// A remote track arrived.
    pub fn track(&self, kind: TrackKind) {
        self.post(Trigger::RemoteTrack {
            generation: self.generation,
            kind,
        });
    }

    /// The connection wants renegotiation. Offers are only ever driven by
    /// `canAccept`, so this is informational.
    pub fn negotiation_needed(&self) {
        tracing::debug!(generation = self.generation, "negotiation needed");
    }

    /// The connection failed for good.
    pub fn failed(&self, reason: impl Into<String>) {
        self.post(Trigger::PeerConnectionFailed {
            generation: self.generation,
            reason: reason.into(),
        });
    }

    fn post(&self, trigger: Trigger) {
        if self.tx.send(Input::Trigger(trigger)).is_err() {
            tracing::trace!("negotiator stopped, dropping peer event");
        }
    }
}

impl std::fmt::Debug for PeerEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEvents")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
