//! Scripted adapters for exercising the negotiator without a media stack.
//!
//! Used by the unit tests in this crate and by `tests/call_flow.rs`.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::SignalInfo;
use tokio::sync::mpsc;

use super::negotiator::SignalSink;
use super::peer::{MediaSource, MediaStream, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvents};
use super::{CallError, TrackKind};

/// SDP JSON returned by [`MockPeerConnection::create_offer`].
pub const MOCK_OFFER: &str = r#"{"type":"offer","sdp":"v=0 mock-offer"}"#;

/// SDP JSON returned by [`MockPeerConnection::create_answer`].
pub const MOCK_ANSWER: &str = r#"{"type":"answer","sdp":"v=0 mock-answer"}"#;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A track that only remembers whether it was stopped.
#[derive(Debug)]
pub struct MockTrack {
    kind: TrackKind,
    id: String,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            id: format!("mock-{kind}"),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Media source that either hands out mock tracks or refuses.
#[derive(Debug, Default)]
pub struct MockMedia {
    deny: bool,
    acquired: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockMedia {
    pub fn allow() -> Self {
        Self::default()
    }

    /// A source that always fails with [`CallError::MediaPermissionDenied`].
    pub fn deny() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Every track handed out so far.
    pub fn tracks(&self) -> Vec<Arc<MockTrack>> {
        lock(&self.acquired).clone()
    }
}

impl MediaSource for MockMedia {
    fn acquire<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<MediaStream, CallError>> + Send + 'a>> {
        Box::pin(async move {
            if self.deny {
                return Err(CallError::MediaPermissionDenied);
            }
            let audio = Arc::new(MockTrack::new(TrackKind::Audio));
            let video = Arc::new(MockTrack::new(TrackKind::Video));
            lock(&self.acquired).extend([audio.clone(), video.clone()]);
            Ok(MediaStream::new(
                "mock-stream",
                vec![audio as Arc<dyn MediaTrack>, video as Arc<dyn MediaTrack>],
            ))
        })
    }
}

/// Peer connection that records every call made on it.
///
/// Calls are recorded as `create_offer`, `create_answer`, `set_local`,
/// `set_remote`, `add_candidate:<candidate>`, `add_media:<track count>` and
/// `close`.
pub struct MockPeerConnection {
    events: PeerEvents,
    calls: Mutex<Vec<String>>,
    stable: AtomicBool,
    closed: AtomicBool,
}

impl MockPeerConnection {
    fn new(events: PeerEvents, stable: bool) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            stable: AtomicBool::new(stable),
            closed: AtomicBool::new(false),
        }
    }

    /// Callbacks of this connection, for simulating candidates and tracks.
    pub fn events(&self) -> &PeerEvents {
        &self.events
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn set_stable(&self, stable: bool) {
        self.stable.store(stable, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::PeerConnection("connection closed".into()));
        }
        lock(&self.calls).push(call.into());
        Ok(())
    }
}

impl PeerConnection for MockPeerConnection {
    fn create_offer<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        Box::pin(async move {
            self.record("create_offer")?;
            Ok(MOCK_OFFER.to_string())
        })
    }

    fn create_answer<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<String, CallError>> + Send + 'a>> {
        Box::pin(async move {
            self.record("create_answer")?;
            Ok(MOCK_ANSWER.to_string())
        })
    }

    fn set_local_description<'a>(
        &'a self,
        _sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move { self.record("set_local") })
    }

    fn set_remote_description<'a>(
        &'a self,
        _sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move { self.record("set_remote") })
    }

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move { self.record(format!("add_candidate:{candidate}")) })
    }

    fn add_media<'a>(
        &'a self,
        stream: &'a MediaStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move { self.record(format!("add_media:{}", stream.tracks.len())) })
    }

    fn is_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            lock(&self.calls).push("close".to_string());
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Factory handing out [`MockPeerConnection`]s and keeping them for
/// inspection.
pub struct MockPeerFactory {
    stable: bool,
    fail: bool,
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl Default for MockPeerFactory {
    fn default() -> Self {
        Self {
            stable: true,
            fail: false,
            created: Mutex::new(Vec::new()),
        }
    }
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections start in a non-stable signaling state.
    pub fn unstable() -> Self {
        Self {
            stable: false,
            ..Self::default()
        }
    }

    /// Connection creation always fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.created).clone()
    }

    /// The most recently created connection.
    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        lock(&self.created).last().cloned()
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create<'a>(
        &'a self,
        events: PeerEvents,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerConnection>, CallError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail {
                return Err(CallError::PeerConnection("mock factory refused".into()));
            }
            let connection = Arc::new(MockPeerConnection::new(events, self.stable));
            lock(&self.created).push(connection.clone());
            Ok(connection as Arc<dyn PeerConnection>)
        })
    }
}

/// Signal sink that forwards every sent signal to a channel.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<SignalInfo>,
}

impl RecordingSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SignalSink for RecordingSink {
    fn send_signal<'a>(
        &'a self,
        signal: SignalInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            self.tx.send(signal).map_err(|_| {
                CallError::Transport(protocol::ProtocolError::ConnectionClosed(
                    "recording sink dropped".into(),
                ))
            })
        })
    }
}
