//! Call negotiation state machine.
//!
//! [`transition`] is a pure function from a session and a [`Trigger`] to the
//! next session and the [`Effect`]s the driver must execute, in order. It
//! performs no I/O, so every rule of the negotiation can be tested without a
//! runtime.
//!
//! Asynchronous work (media capture, SDP creation, timers) is started by an
//! effect and reports back as a trigger carrying the session generation that
//! started it. The generation changes whenever a negotiation begins or ends,
//! so results that outlive their negotiation are discarded here.

use protocol::{SignalInfo, SignalType, UserId};

use super::{CallState, Notification, TrackKind};

/// The negotiation session of one client.
///
/// Invariant: `peer_id.is_some()` exactly when `state != Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationSession {
    local_id: UserId,
    peer_id: Option<UserId>,
    state: CallState,
    pending_signal: Option<SignalInfo>,
    request_timestamp: Option<u64>,
    generation: u64,
    remote_description_set: bool,
    pending_candidates: Vec<String>,
}

impl NegotiationSession {
    /// A fresh idle session for the given local identity.
    pub fn new(local_id: impl Into<UserId>) -> Self {
        Self {
            local_id: local_id.into(),
            peer_id: None,
            state: CallState::Idle,
            pending_signal: None,
            request_timestamp: None,
            generation: 0,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// The request awaiting the user's consent, while `Thinking`.
    pub fn pending_signal(&self) -> Option<&SignalInfo> {
        self.pending_signal.as_ref()
    }

    /// Wall-clock ms of our outgoing request, while `Requesting`.
    pub fn request_timestamp(&self) -> Option<u64> {
        self.request_timestamp
    }

    /// Token identifying the current negotiation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remote candidates held until the remote description is applied.
    pub fn pending_candidates(&self) -> &[String] {
        &self.pending_candidates
    }

    fn begin(&mut self, state: CallState, peer_id: UserId) {
        self.generation = self.generation.wrapping_add(1);
        self.state = state;
        self.peer_id = Some(peer_id);
        self.pending_signal = None;
        self.request_timestamp = None;
        self.remote_description_set = false;
        self.pending_candidates.clear();
    }

    fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.state = CallState::Idle;
        self.peer_id = None;
        self.pending_signal = None;
        self.request_timestamp = None;
        self.remote_description_set = false;
        self.pending_candidates.clear();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state.has_peer_connection()
    }

    /// A `Send` effect addressed to the current peer, if there is one.
    fn to_peer(&self, signal_type: SignalType, value: impl Into<String>) -> Option<Effect> {
        self.peer_id.as_ref().map(|peer| {
            Effect::Send(SignalInfo::new(
                self.local_id.clone(),
                peer.clone(),
                signal_type,
                value,
            ))
        })
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    // Local commands
    /// Place a call; `now_ms` is the wall-clock time used for glare resolution.
    Call { peer_id: UserId, now_ms: u64 },
    /// Consent to the pending request.
    Accept,
    /// Decline the pending request.
    Deny,
    /// End whatever negotiation is in progress.
    HangUp,

    // Relay
    /// A signal arrived. `peer_connection_stable` reports whether the current
    /// peer connection is in the stable signaling state.
    Signal {
        signal: SignalInfo,
        peer_connection_stable: bool,
    },
    /// A client left the relay.
    PeerOffline { peer_id: UserId },

    // Completions of work started by effects
    RequestTimedOut { generation: u64 },
    OfferCreated { generation: u64, sdp: String },
    AnswerCreated { generation: u64, sdp: String },
    LocalCandidate { generation: u64, candidate: String },
    RemoteTrack { generation: u64, kind: TrackKind },
    MediaDenied { generation: u64 },
    PeerConnectionFailed { generation: u64, reason: String },
}

/// Side effect requested by a transition, executed by the driver in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Seal and send a signal through the relay.
    Send(SignalInfo),
    /// Ask the user whether to accept a call from the peer.
    PromptConsent { peer_id: UserId },
    /// Tell the user how a negotiation ended.
    Notify(Notification),
    /// Surface a remote track to the presentation layer.
    RemoteTrack { peer_id: UserId, kind: TrackKind },
    /// Start the request timer for this generation.
    ArmRequestTimer { generation: u64 },
    /// Create the peer connection for this generation.
    OpenPeerConnection { generation: u64 },
    /// Acquire media, attach it, create and apply the local offer.
    CreateOffer,
    /// Apply the remote offer, acquire and attach media, create and apply the answer.
    AnswerOffer { sdp: String },
    /// Apply the remote answer.
    ApplyAnswer { sdp: String },
    /// Add a remote ICE candidate.
    AddCandidate { candidate: String },
    /// Stop local tracks and close the peer connection.
    ReleasePeerConnection,
}

/// Compute the next session and the effects of applying `trigger`.
///
/// Pairs of state and trigger the machine does not know are ignored: the
/// session comes back unchanged with no effects.
pub fn transition(
    session: &NegotiationSession,
    trigger: Trigger,
) -> (NegotiationSession, Vec<Effect>) {
    let mut next = session.clone();
    let mut effects = Vec::new();

    match trigger {
        Trigger::Call { peer_id, now_ms } => on_call(&mut next, &mut effects, peer_id, now_ms),
        Trigger::Accept => on_accept(&mut next, &mut effects),
        Trigger::Deny => on_deny(&mut next, &mut effects),
        Trigger::HangUp => on_hang_up(&mut next, &mut effects),
        Trigger::Signal {
            signal,
            peer_connection_stable,
        } => on_signal(&mut next, &mut effects, signal, peer_connection_stable),
        Trigger::PeerOffline { peer_id } => {
            if next.peer_id.as_deref() == Some(peer_id.as_str()) {
                tracing::info!(peer = %peer_id, "call peer went offline");
                end(&mut next, &mut effects, Some(Notification::HungUp));
            }
        }
        Trigger::RequestTimedOut { generation } => {
            if next.generation == generation && next.state == CallState::Requesting {
                effects.extend(next.to_peer(SignalType::Stop, ""));
                end(&mut next, &mut effects, Some(Notification::TimedOut));
            }
        }
        Trigger::OfferCreated { generation, sdp } => {
            if next.generation == generation && next.state == CallState::Offering {
                effects.extend(next.to_peer(SignalType::Offer, sdp));
            }
        }
        Trigger::AnswerCreated { generation, sdp } => {
            if next.generation == generation && next.state == CallState::Communicating {
                effects.extend(next.to_peer(SignalType::Answer, sdp));
            }
        }
        Trigger::LocalCandidate {
            generation,
            candidate,
        } => {
            if next.is_current(generation) {
                effects.extend(next.to_peer(SignalType::NewCandidate, candidate));
            }
        }
        Trigger::RemoteTrack { generation, kind } => {
            if next.is_current(generation) {
                if let Some(peer_id) = next.peer_id.clone() {
                    effects.push(Effect::RemoteTrack { peer_id, kind });
                }
            }
        }
        Trigger::MediaDenied { generation } => {
            if next.is_current(generation) {
                effects.extend(next.to_peer(SignalType::Deny, ""));
                end(&mut next, &mut effects, Some(Notification::PermissionDenied));
            }
        }
        Trigger::PeerConnectionFailed { generation, reason } => {
            if next.is_current(generation) {
                effects.extend(next.to_peer(SignalType::Deny, ""));
                end(&mut next, &mut effects, Some(Notification::CallFailed(reason)));
            }
        }
    }

    (next, effects)
}

/// Return to `Idle`, releasing the peer connection if one exists.
fn end(next: &mut NegotiationSession, effects: &mut Vec<Effect>, notice: Option<Notification>) {
    if next.state.has_peer_connection() {
        effects.push(Effect::ReleasePeerConnection);
    }
    next.reset();
    if let Some(notice) = notice {
        effects.push(Effect::Notify(notice));
    }
}

fn on_call(next: &mut NegotiationSession, effects: &mut Vec<Effect>, peer_id: UserId, now_ms: u64) {
    if next.state != CallState::Idle {
        tracing::debug!(state = %next.state, "call ignored while negotiating");
        return;
    }
    if peer_id == next.local_id {
        tracing::debug!("call to self ignored");
        return;
    }

    next.begin(CallState::Requesting, peer_id);
    next.request_timestamp = Some(now_ms);
    effects.extend(next.to_peer(SignalType::RequestVideo, now_ms.to_string()));
    effects.push(Effect::ArmRequestTimer {
        generation: next.generation,
    });
}

fn on_accept(next: &mut NegotiationSession, effects: &mut Vec<Effect>) {
    if next.state != CallState::Thinking {
        return;
    }
    let Some(request) = next.pending_signal.take() else {
        return;
    };

    effects.push(Effect::Send(request.reply(SignalType::CanAccept, "")));
    next.state = CallState::WaitOffering;
    effects.push(Effect::OpenPeerConnection {
        generation: next.generation,
    });
}

fn on_deny(next: &mut NegotiationSession, effects: &mut Vec<Effect>) {
    if next.state != CallState::Thinking {
        return;
    }
    effects.extend(next.to_peer(SignalType::Deny, ""));
    end(next, effects, None);
}

fn on_hang_up(next: &mut NegotiationSession, effects: &mut Vec<Effect>) {
    match next.state {
        CallState::Idle => {}
        CallState::Thinking => on_deny(next, effects),
        _ => {
            effects.extend(next.to_peer(SignalType::Stop, ""));
            end(next, effects, None);
        }
    }
}

fn on_signal(
    next: &mut NegotiationSession,
    effects: &mut Vec<Effect>,
    signal: SignalInfo,
    peer_connection_stable: bool,
) {
    if signal.to_id != next.local_id {
        tracing::trace!(to = %signal.to_id, "dropping signal addressed elsewhere");
        return;
    }

    if signal.signal_type == SignalType::RequestVideo {
        on_request(next, effects, signal);
        return;
    }

    if next.peer_id.as_deref() != Some(signal.from_id.as_str()) {
        tracing::trace!(
            from = %signal.from_id,
            signal_type = %signal.signal_type,
            "dropping signal from outside the negotiation"
        );
        return;
    }

    match (next.state, signal.signal_type) {
        (CallState::Requesting, SignalType::CanAccept) => {
            next.state = CallState::Offering;
            effects.push(Effect::OpenPeerConnection {
                generation: next.generation,
            });
            effects.push(Effect::CreateOffer);
        }
        (CallState::Requesting, SignalType::RequestedFirst) => {
            tracing::info!(peer = %signal.from_id, "peer requested first, still waiting");
        }
        (CallState::Requesting, SignalType::Busying) => {
            end(next, effects, Some(Notification::PeerBusy));
        }
        (CallState::Requesting, SignalType::Deny) => {
            end(next, effects, Some(Notification::PeerDenied));
        }
        (CallState::WaitOffering, SignalType::Offer) => {
            if peer_connection_stable {
                next.state = CallState::Communicating;
                next.remote_description_set = true;
                effects.push(Effect::AnswerOffer { sdp: signal.value });
                flush_candidates(next, effects);
            } else {
                effects.push(Effect::Send(signal.reply(SignalType::Busying, "")));
            }
        }
        (CallState::Offering, SignalType::Answer) => {
            next.state = CallState::Communicating;
            next.remote_description_set = true;
            effects.push(Effect::ApplyAnswer { sdp: signal.value });
            flush_candidates(next, effects);
        }
        (CallState::Offering, SignalType::Busying) => {
            effects.push(Effect::Send(signal.reply(SignalType::Stop, "")));
            end(next, effects, Some(Notification::PeerBusy));
        }
        (state, SignalType::NewCandidate) if state.has_peer_connection() => {
            if next.remote_description_set {
                effects.push(Effect::AddCandidate {
                    candidate: signal.value,
                });
            } else {
                next.pending_candidates.push(signal.value);
            }
        }
        (state, SignalType::Deny) if state.has_peer_connection() => {
            end(next, effects, Some(Notification::PeerDenied));
        }
        (state, SignalType::Stop) if state != CallState::Idle => {
            end(next, effects, Some(Notification::HungUp));
        }
        (state, signal_type) => {
            tracing::debug!(%state, %signal_type, "ignoring unexpected signal");
        }
    }
}

fn on_request(next: &mut NegotiationSession, effects: &mut Vec<Effect>, signal: SignalInfo) {
    let from_peer = next.peer_id.as_deref() == Some(signal.from_id.as_str());

    if next.state == CallState::Requesting && from_peer {
        if let (Some(local), Ok(remote)) = (next.request_timestamp, signal.value.parse::<u64>()) {
            let we_win = local < remote || (local == remote && next.local_id < signal.from_id);
            if we_win {
                effects.push(Effect::Send(signal.reply(SignalType::RequestedFirst, "")));
                return;
            }
            tracing::info!(peer = %signal.from_id, "peer requested first, yielding");
            next.reset();
        }
    }

    if next.state == CallState::Idle && signal.from_id != next.local_id {
        let peer_id = signal.from_id.clone();
        next.begin(CallState::Thinking, peer_id.clone());
        next.pending_signal = Some(signal);
        effects.push(Effect::PromptConsent { peer_id });
    } else {
        effects.push(Effect::Send(signal.reply(SignalType::Busying, "")));
    }
}

fn flush_candidates(next: &mut NegotiationSession, effects: &mut Vec<Effect>) {
    effects.extend(
        next.pending_candidates
            .drain(..)
            .map(|candidate| Effect::AddCandidate { candidate }),
    );
}
