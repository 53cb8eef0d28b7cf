//! Async driver for the call state machine.
//!
//! The [`CallNegotiator`] owns the [`NegotiationSession`] and is the only
//! place it changes. Commands from the user, signals from the router, timer
//! expiries and peer-connection completions all arrive on one queue and are
//! applied one at a time through [`transition`], so no two triggers ever
//! interleave.
//!
//! Work on the peer connection runs in a per-negotiation worker task that
//! executes jobs in submission order. Releasing the connection cancels the
//! worker, which then stops local media and closes the connection.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::{Envelope, Message, SignalInfo, UserId};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::peer::{MediaSource, MediaStream, PeerConnection, PeerConnectionFactory, PeerEvents};
use super::state::{transition, Effect, NegotiationSession, Trigger};
use super::{CallError, CallState};
use crate::network::SecureSender;
use crate::presenter::Presenter;

/// Default time an outgoing request waits for an answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound path for signals.
pub trait SignalSink: Send + Sync {
    fn send_signal<'a>(
        &'a self,
        signal: SignalInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>>;
}

impl SignalSink for SecureSender {
    fn send_signal<'a>(
        &'a self,
        signal: SignalInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'a>> {
        Box::pin(async move {
            self.send_envelope(&Envelope::new(Message::Signal(signal)))
                .await
                .map_err(CallError::from)
        })
    }
}

/// Everything the negotiator reacts to.
#[derive(Debug)]
pub(crate) enum Input {
    Trigger(Trigger),
    /// A signal from the relay; stability is sampled when it is applied.
    Signal(SignalInfo),
}

/// Observable summary of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: CallState,
    pub peer_id: Option<UserId>,
    pub generation: u64,
}

impl SessionSnapshot {
    fn of(session: &NegotiationSession) -> Self {
        Self {
            state: session.state(),
            peer_id: session.peer_id().map(str::to_owned),
            generation: session.generation(),
        }
    }
}

/// Handle for feeding and observing a running negotiator. Cheap to clone.
#[derive(Clone)]
pub struct NegotiatorHandle {
    inputs: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl NegotiatorHandle {
    /// Ask `peer_id` for a call.
    pub fn call(&self, peer_id: impl Into<UserId>) {
        self.trigger(Trigger::Call {
            peer_id: peer_id.into(),
            now_ms: now_ms(),
        });
    }

    /// Accept the pending request.
    pub fn accept(&self) {
        self.trigger(Trigger::Accept);
    }

    /// Decline the pending request.
    pub fn deny(&self) {
        self.trigger(Trigger::Deny);
    }

    /// End the current negotiation or call.
    pub fn hang_up(&self) {
        self.trigger(Trigger::HangUp);
    }

    /// Deliver a signal received from the relay.
    pub fn signal(&self, signal: SignalInfo) {
        self.submit(Input::Signal(signal));
    }

    /// A client left the relay.
    pub fn peer_offline(&self, peer_id: impl Into<UserId>) {
        self.trigger(Trigger::PeerOffline {
            peer_id: peer_id.into(),
        });
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    /// Wait until the session satisfies `predicate`.
    ///
    /// Returns `None` if the negotiator stops first.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|snapshot| predicate(snapshot)).await;
        result.ok().map(|snapshot| (*snapshot).clone())
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for_state(&self, state: CallState) -> Option<SessionSnapshot> {
        self.wait_for(|snapshot| snapshot.state == state).await
    }

    /// Hang up any negotiation and stop the negotiator.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.inputs.is_closed()
    }

    fn trigger(&self, trigger: Trigger) {
        self.submit(Input::Trigger(trigger));
    }

    fn submit(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            tracing::debug!("negotiator stopped, dropping input");
        }
    }
}

impl std::fmt::Debug for NegotiatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatorHandle")
            .field("snapshot", &*self.snapshot.borrow())
            .finish_non_exhaustive()
    }
}

/// The peer connection of the current negotiation.
struct ActivePeer {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    jobs: mpsc::UnboundedSender<PeerJob>,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum PeerJob {
    CreateOffer,
    AnswerOffer(String),
    ApplyAnswer(String),
    AddCandidate(String),
}

/// Drives one client's negotiation session.
pub struct CallNegotiator {
    session: NegotiationSession,
    sink: Arc<dyn SignalSink>,
    factory: Arc<dyn PeerConnectionFactory>,
    media: Arc<dyn MediaSource>,
    presenter: Arc<dyn Presenter>,
    request_timeout: Duration,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,
    snapshot: watch::Sender<SessionSnapshot>,
    peer: Option<ActivePeer>,
    cancel: CancellationToken,
}

impl CallNegotiator {
    pub fn new(
        local_id: impl Into<UserId>,
        sink: Arc<dyn SignalSink>,
        factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaSource>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        let session = NegotiationSession::new(local_id);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SessionSnapshot::of(&session));

        Self {
            session,
            sink,
            factory,
            media,
            presenter,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inputs_tx,
            inputs_rx,
            snapshot,
            peer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn handle(&self) -> NegotiatorHandle {
        NegotiatorHandle {
            inputs: self.inputs_tx.clone(),
            snapshot: self.snapshot.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run the negotiator on a new task.
    pub fn spawn(self) -> NegotiatorHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Apply inputs until shut down.
    pub async fn run(mut self) {
        tracing::debug!(local = %self.session.local_id(), "negotiator started");

        loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                input = self.inputs_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };

            match input {
                Input::Trigger(trigger) => self.apply(trigger).await,
                Input::Signal(signal) => {
                    let peer_connection_stable = self
                        .peer
                        .as_ref()
                        .is_some_and(|peer| peer.connection.is_stable());
                    self.apply(Trigger::Signal {
                        signal,
                        peer_connection_stable,
                    })
                    .await;
                }
            }
        }

        if self.session.state() != CallState::Idle {
            self.apply(Trigger::HangUp).await;
        }
        self.release_peer();
        tracing::debug!(local = %self.session.local_id(), "negotiator stopped");
    }

    async fn apply(&mut self, trigger: Trigger) {
        let mut queue = VecDeque::from([trigger]);

        while let Some(trigger) = queue.pop_front() {
            let (next, effects) = transition(&self.session, trigger);
            let previous = std::mem::replace(&mut self.session, next);
            self.publish(&previous);

            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    fn publish(&self, previous: &NegotiationSession) {
        let state = self.session.state();
        if state != previous.state() || self.session.peer_id() != previous.peer_id() {
            tracing::info!(
                from = %previous.state(),
                to = %state,
                peer = ?self.session.peer_id(),
                "call state changed"
            );
            self.presenter.state_changed(state, self.session.peer_id());
        }
        if self.session.generation() != previous.generation() || state != previous.state() {
            self.snapshot.send_replace(SessionSnapshot::of(&self.session));
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Trigger> {
        match effect {
            Effect::Send(signal) => {
                tracing::debug!(to = %signal.to_id, signal_type = %signal.signal_type, "sending signal");
                if let Err(e) = self.sink.send_signal(signal).await {
                    tracing::warn!(error = %e, "failed to send signal");
                }
            }
            Effect::PromptConsent { peer_id } => self.presenter.consent_requested(&peer_id),
            Effect::Notify(notification) => self.presenter.notify(&notification),
            Effect::RemoteTrack { peer_id, kind } => self.presenter.remote_track(&peer_id, kind),
            Effect::ArmRequestTimer { generation } => self.arm_timer(generation),
            Effect::OpenPeerConnection { generation } => {
                return self.open_peer(generation).await;
            }
            Effect::CreateOffer => self.enqueue(PeerJob::CreateOffer),
            Effect::AnswerOffer { sdp } => self.enqueue(PeerJob::AnswerOffer(sdp)),
            Effect::ApplyAnswer { sdp } => self.enqueue(PeerJob::ApplyAnswer(sdp)),
            Effect::AddCandidate { candidate } => self.enqueue(PeerJob::AddCandidate(candidate)),
            Effect::ReleasePeerConnection => self.release_peer(),
        }
        None
    }

    fn arm_timer(&self, generation: u64) {
        let inputs = self.inputs_tx.clone();
        let cancel = self.cancel.clone();
        let timeout = self.request_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = inputs.send(Input::Trigger(Trigger::RequestTimedOut { generation }));
                }
            }
        });
    }

    async fn open_peer(&mut self, generation: u64) -> Option<Trigger> {
        self.release_peer();

        let events = PeerEvents::new(generation, self.inputs_tx.clone());
        let connection = match self.factory.create(events).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(error = %e, "failed to create peer connection");
                return Some(Trigger::PeerConnectionFailed {
                    generation,
                    reason: e.to_string(),
                });
            }
        };

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let worker = PeerWorker {
            generation,
            connection: connection.clone(),
            media: self.media.clone(),
            inputs: self.inputs_tx.clone(),
            local_media: None,
        };
        tokio::spawn(worker.run(jobs_rx, cancel.clone()));

        self.peer = Some(ActivePeer {
            generation,
            connection,
            jobs: jobs_tx,
            cancel,
        });
        None
    }

    fn enqueue(&self, job: PeerJob) {
        match &self.peer {
            Some(peer) => {
                if peer.jobs.send(job).is_err() {
                    tracing::debug!(generation = peer.generation, "peer worker gone");
                }
            }
            None => tracing::debug!(?job, "no peer connection for job"),
        }
    }

    fn release_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            tracing::debug!(generation = peer.generation, "releasing peer connection");
            peer.cancel.cancel();
        }
    }
}

/// Sequential executor for one peer connection.
struct PeerWorker {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    media: Arc<dyn MediaSource>,
    inputs: mpsc::UnboundedSender<Input>,
    local_media: Option<MediaStream>,
}

impl PeerWorker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<PeerJob>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // Jobs run to completion so acquired media is always recorded
            let completion = match self.run_job(job).await {
                Ok(completion) => completion,
                Err(CallError::MediaPermissionDenied) => Some(Trigger::MediaDenied {
                    generation: self.generation,
                }),
                Err(e) => {
                    tracing::warn!(generation = self.generation, error = %e, "peer connection job failed");
                    Some(Trigger::PeerConnectionFailed {
                        generation: self.generation,
                        reason: e.to_string(),
                    })
                }
            };

            if let Some(trigger) = completion {
                if !cancel.is_cancelled() {
                    let _ = self.inputs.send(Input::Trigger(trigger));
                }
            }
        }

        if let Some(stream) = self.local_media.take() {
            stream.stop();
        }
        if let Err(e) = self.connection.close().await {
            tracing::debug!(error = %e, "peer connection close failed");
        }
        tracing::debug!(generation = self.generation, "peer connection closed");
    }

    async fn run_job(&mut self, job: PeerJob) -> Result<Option<Trigger>, CallError> {
        match job {
            PeerJob::CreateOffer => {
                self.attach_media().await?;
                let sdp = self.connection.create_offer().await?;
                self.connection.set_local_description(&sdp).await?;
                Ok(Some(Trigger::OfferCreated {
                    generation: self.generation,
                    sdp,
                }))
            }
            PeerJob::AnswerOffer(offer) => {
                self.connection.set_remote_description(&offer).await?;
                self.attach_media().await?;
                let sdp = self.connection.create_answer().await?;
                self.connection.set_local_description(&sdp).await?;
                Ok(Some(Trigger::AnswerCreated {
                    generation: self.generation,
                    sdp,
                }))
            }
            PeerJob::ApplyAnswer(answer) => {
                self.connection.set_remote_description(&answer).await?;
                Ok(None)
            }
            PeerJob::AddCandidate(candidate) => {
                if let Err(e) = self.connection.add_ice_candidate(&candidate).await {
                    tracing::warn!(error = %e, "skipping remote ICE candidate");
                }
                Ok(None)
            }
        }
    }

    async fn attach_media(&mut self) -> Result<(), CallError> {
        if self.local_media.is_some() {
            return Ok(());
        }
        let stream = self.media.acquire().await?;
        let stream = self.local_media.insert(stream);
        self.connection.add_media(stream).await
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
