//! webrtc-rs implementation of the peer-connection and media contracts.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::peer::{MediaSource, MediaStream, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvents};
use super::{CallError, TrackKind};

/// ICE server entry, as written in the `[ice]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// STUN/TURN server URLs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Settings for every peer connection the factory creates.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl WebRtcConfig {
    pub fn with_ice_servers(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().cloned().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Creates [`WebRtcPeer`]s.
#[derive(Debug, Clone, Default)]
pub struct WebRtcPeerFactory {
    config: WebRtcConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    async fn build(&self, events: PeerEvents) -> Result<Arc<dyn PeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::PeerConnection(format!("failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            CallError::PeerConnection(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let connection = api
            .new_peer_connection(self.config.to_rtc_configuration())
            .await
            .map_err(|e| {
                CallError::PeerConnection(format!("failed to create peer connection: {}", e))
            })?;
        let connection = Arc::new(connection);

        wire_callbacks(&connection, events);

        Ok(Arc::new(WebRtcPeer { connection }))
    }
}

impl PeerConnectionFactory for WebRtcPeerFactory {
    fn create<'a>(
        &'a self,
        events: PeerEvents,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerConnection>, CallError>> + Send + 'a>> {
        Box::pin(self.build(events))
    }
}

fn wire_callbacks(connection: &RTCPeerConnection, events: PeerEvents) {
    let candidate_events = events.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json().map_err(|e| e.to_string()).and_then(|init| {
                serde_json::to_string(&init).map_err(|e| e.to_string())
            }) {
                Ok(json) => events.ice_candidate(json),
                Err(e) => tracing::warn!(error = %e, "failed to encode local candidate"),
            }
        })
    }));

    let track_events = events.clone();
    connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let events = track_events.clone();
            Box::pin(async move {
                match track.kind() {
                    RTPCodecType::Audio => events.track(TrackKind::Audio),
                    RTPCodecType::Video => events.track(TrackKind::Video),
                    other => tracing::debug!(kind = ?other, "ignoring remote track"),
                }
            })
        },
    ));

    let negotiation_events = events.clone();
    connection.on_negotiation_needed(Box::new(move || {
        let events = negotiation_events.clone();
        Box::pin(async move { events.negotiation_needed() })
    }));

    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            tracing::debug!("peer connection state changed: {:?}", state);
            if state == RTCPeerConnectionState::Failed {
                events.failed("peer connection failed");
            }
        })
    }));
}

/// A live webrtc-rs peer connection.
pub struct WebRtcPeer {
    connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    fn parse_description(sdp: &str) -> Result<RTCSessionDescription, CallError> {
        serde_json::from_str(sdp).map_err(|e| CallError::InvalidSdp(e.to_string()))
    }

    fn encode_description(description: &RTCSessionDescription) -> Result<String, CallError> {
        serde_json::to_string(description).map_err(|e| CallError::InvalidSdp(e.to_string()))
    }
}

impl PeerConnection for WebRtcPeer {
    fn create_offer<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        Box::pin(async move {
            let offer = self
                .connection
                .create_offer(None)
                .await
                .map_err(|e| CallError::PeerConnection(format!("failed to create offer: {}", e)))?;
            Self::encode_description(&offer)
        })
    }

    fn create_answer<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        Box::pin(async move {
            let answer = self
                .connection
                .create_answer(None)
                .await
                .map_err(|e| CallError::PeerConnection(format!("failed to create answer: {}", e)))?;
            Self::encode_description(&answer)
        })
    }

    fn set_local_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            let description = Self::parse_description(sdp)?;
            self.connection
                .set_local_description(description)
                .await
                .map_err(|e| {
                    CallError::PeerConnection(format!("failed to set local description: {}", e))
                })
        })
    }

    fn set_remote_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            let description = Self::parse_description(sdp)?;
            self.connection
                .set_remote_description(description)
                .await
                .map_err(|e| {
                    CallError::PeerConnection(format!("failed to set remote description: {}", e))
                })
        })
    }

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            let init: RTCIceCandidateInit = serde_json::from_str(candidate)
                .map_err(|e| CallError::InvalidCandidate(e.to_string()))?;
            self.connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| CallError::InvalidCandidate(e.to_string()))
        })
    }

    fn add_media<'a>(
        &'a self,
        stream: &'a MediaStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            for track in &stream.tracks {
                let local = track
                    .as_any()
                    .downcast_ref::<WebRtcTrack>()
                    .ok_or_else(|| {
                        CallError::PeerConnection(format!("track {} is not a webrtc track", track.id()))
                    })?;
                self.connection
                    .add_track(Arc::clone(&local.track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| CallError::PeerConnection(format!("failed to add track: {}", e)))?;
            }
            Ok(())
        })
    }

    fn is_stable(&self) -> bool {
        self.connection.signaling_state() == RTCSignalingState::Stable
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            self.connection
                .close()
                .await
                .map_err(|e| CallError::PeerConnection(format!("failed to close: {}", e)))
        })
    }
}

/// Local track backed by a webrtc-rs sample track.
pub struct WebRtcTrack {
    kind: TrackKind,
    id: String,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl WebRtcTrack {
    fn new(kind: TrackKind, stream_id: &str) -> Self {
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let id = format!("{kind}-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            kind,
            id,
            track,
            stopped: AtomicBool::new(false),
        }
    }

    /// The sample track that media is written to.
    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for WebRtcTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(track = %self.id, "local track stopped");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source for hosts without capture devices.
///
/// Hands out one Opus audio and one VP8 video track per call so the
/// negotiation advertises both media sections. Nothing is written to them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticMedia;

impl MediaSource for SyntheticMedia {
    fn acquire<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MediaStream, CallError>> + Send + 'a>> {
        Box::pin(async move {
            let stream_id = format!("stream-{}", uuid::Uuid::new_v4());
            let tracks: Vec<Arc<dyn MediaTrack>> = vec![
                Arc::new(WebRtcTrack::new(TrackKind::Audio, &stream_id)),
                Arc::new(WebRtcTrack::new(TrackKind::Video, &stream_id)),
            ];
            Ok(MediaStream::new(stream_id, tracks))
        })
    }
}

/// Media source that always refuses, for `call.allow_media = false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeniedMedia;

impl MediaSource for DeniedMedia {
    fn acquire<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MediaStream, CallError>> + Send + 'a>> {
        Box::pin(async { Err(CallError::MediaPermissionDenied) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::MockTrack;
    use tokio::sync::mpsc;

    fn events() -> PeerEvents {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerEvents::new(1, tx)
    }

    #[test]
    fn test_ice_server_to_rtc() {
        let rtc: RTCIceServer = IceServer::turn("turn:turn.example.com:3478", "user", "pass")
            .with_url("turns:turn.example.com:5349")
            .into();
        assert_eq!(rtc.urls.len(), 2);
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "pass");

        let rtc: RTCIceServer = IceServer::stun("stun:stun.example.com").into();
        assert!(rtc.username.is_empty());
    }

    #[test]
    fn test_ice_server_serde_omits_missing_credentials() {
        let json = serde_json::to_string(&IceServer::stun("stun:a")).unwrap();
        assert_eq!(json, r#"{"urls":["stun:a"]}"#);

        let parsed: IceServer = serde_json::from_str(r#"{"urls":["stun:a"]}"#).unwrap();
        assert_eq!(parsed, IceServer::stun("stun:a"));
    }

    #[test]
    fn test_rtc_configuration_carries_servers() {
        let config = WebRtcConfig::with_ice_servers(vec![
            IceServer::stun("stun:a"),
            IceServer::stun("stun:b"),
        ]);
        assert_eq!(config.to_rtc_configuration().ice_servers.len(), 2);
    }

    #[tokio::test]
    async fn test_synthetic_media_has_audio_and_video() {
        let stream = SyntheticMedia.acquire().await.unwrap();
        let kinds: Vec<_> = stream.tracks.iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![TrackKind::Audio, TrackKind::Video]);

        stream.stop();
        for track in &stream.tracks {
            let track = track.as_any().downcast_ref::<WebRtcTrack>().unwrap();
            assert!(track.is_stopped());
        }
    }

    #[tokio::test]
    async fn test_denied_media() {
        assert!(matches!(
            DeniedMedia.acquire().await,
            Err(CallError::MediaPermissionDenied)
        ));
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_peers() {
        let factory = WebRtcPeerFactory::new(WebRtcConfig::default());
        let offerer = factory.create(events()).await.unwrap();
        let answerer = factory.create(events()).await.unwrap();
        assert!(offerer.is_stable());

        let local = SyntheticMedia.acquire().await.unwrap();
        offerer.add_media(&local).await.unwrap();
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(&offer).await.unwrap();
        assert!(!offerer.is_stable());
        assert!(offer.contains(r#""type":"offer""#));

        answerer.set_remote_description(&offer).await.unwrap();
        let remote = SyntheticMedia.acquire().await.unwrap();
        answerer.add_media(&remote).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(&answer).await.unwrap();
        offerer.set_remote_description(&answer).await.unwrap();
        assert!(offerer.is_stable());
        assert!(answerer.is_stable());

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_payloads_rejected() {
        let peer = WebRtcPeerFactory::default().create(events()).await.unwrap();

        assert!(matches!(
            peer.set_remote_description("not json").await,
            Err(CallError::InvalidSdp(_))
        ));
        assert!(matches!(
            peer.add_ice_candidate("{").await,
            Err(CallError::InvalidCandidate(_))
        ));

        let foreign = MediaStream::new("s", vec![Arc::new(MockTrack::new(TrackKind::Audio))]);
        assert!(matches!(
            peer.add_media(&foreign).await,
            Err(CallError::PeerConnection(_))
        ));
        peer.close().await.unwrap();
    }
}
