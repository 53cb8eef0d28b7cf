//! End-to-end call flows.
//!
//! Each test runs real clients against an in-process relay over in-memory
//! channels. The relay performs the same key exchange as a real one, assigns
//! ids, announces presence and forwards signals by recipient. Peer
//! connections and media are the scripted adapters from `call::testing`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use client::call::testing::{MockMedia, MockPeerFactory, MOCK_ANSWER, MOCK_OFFER};
use client::network::{memory_pair, open_secure_channel, SecureSender};
use client::{CallClient, CallState, ChannelPresenter, ClientOptions, Notification, PresenterEvent};
use protocol::{Envelope, Message, SignalInfo, SignalType};
use tokio::sync::{mpsc, Mutex};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Relay
// =============================================================================

#[derive(Default)]
struct Relay {
    clients: Mutex<HashMap<String, (String, SecureSender)>>,
    next_id: AtomicU64,
    /// Every signal the relay forwarded, in order.
    forwarded: Mutex<Vec<SignalInfo>>,
}

impl Relay {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn forwarded_types(&self) -> Vec<SignalType> {
        self.forwarded
            .lock()
            .await
            .iter()
            .map(|s| s.signal_type)
            .collect()
    }

    /// Accept one client connection and serve it until it closes.
    fn accept(self: &Arc<Self>, name: &str) -> client::network::RawChannel {
        let (client_side, relay_side) = memory_pair();
        let relay = Arc::clone(self);
        let name = name.to_string();

        tokio::spawn(async move {
            let (tx, mut rx) = open_secure_channel(relay_side, WAIT).await.unwrap();
            let id = (relay.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();

            {
                let mut clients = relay.clients.lock().await;
                send(&tx, Message::SetUser {
                    id: id.clone(),
                    name: name.clone(),
                })
                .await;
                for (other_id, (other_name, other_tx)) in clients.iter() {
                    send(&tx, Message::UserOnline {
                        id: other_id.clone(),
                        name: other_name.clone(),
                    })
                    .await;
                    send(other_tx, Message::UserOnline {
                        id: id.clone(),
                        name: name.clone(),
                    })
                    .await;
                }
                clients.insert(id.clone(), (name, tx));
            }

            while let Ok(Some(envelope)) = rx.next_envelope().await {
                relay.route(&id, envelope.msg_type).await;
            }

            let mut clients = relay.clients.lock().await;
            clients.remove(&id);
            for (_, other_tx) in clients.values() {
                send(other_tx, Message::UserOffline {
                    id: id.clone(),
                    name: None,
                })
                .await;
            }
        });

        client_side
    }

    async fn route(&self, from: &str, message: Message) {
        let clients = self.clients.lock().await;
        match message {
            Message::Signal(signal) => {
                self.forwarded.lock().await.push(signal.clone());
                if let Some((_, tx)) = clients.get(&signal.to_id) {
                    send(tx, Message::Signal(signal)).await;
                }
            }
            Message::TalkTo { to, msg } => {
                if let Some((_, tx)) = clients.get(&to) {
                    send(tx, Message::Msg {
                        from: from.to_string(),
                        msg,
                    })
                    .await;
                }
            }
            _ => {}
        }
    }
}

async fn send(tx: &SecureSender, message: Message) {
    let _ = tx.send_envelope(&Envelope::new(message)).await;
}

// =============================================================================
// Clients
// =============================================================================

struct Peer {
    client: CallClient,
    factory: Arc<MockPeerFactory>,
    media: Arc<MockMedia>,
    events: mpsc::UnboundedReceiver<PresenterEvent>,
}

impl Peer {
    async fn join(relay: &Arc<Relay>, name: &str) -> Self {
        Self::join_with(relay, name, MockMedia::allow()).await
    }

    async fn join_with(relay: &Arc<Relay>, name: &str, media: MockMedia) -> Self {
        let (presenter, events) = ChannelPresenter::new();
        let factory = Arc::new(MockPeerFactory::new());
        let media = Arc::new(media);

        let client = CallClient::start(
            relay.accept(name),
            ClientOptions::default(),
            factory.clone(),
            media.clone(),
            Arc::new(presenter),
        )
        .await
        .unwrap();

        Self {
            client,
            factory,
            media,
            events,
        }
    }

    fn id(&self) -> String {
        self.client.local_id().to_string()
    }

    async fn next_event(&mut self, mut matches: impl FnMut(&PresenterEvent) -> bool) -> PresenterEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for presenter event")
    }

    async fn wait_online(&mut self, count: usize) {
        self.next_event(|e| matches!(e, PresenterEvent::Roster(c) if c.len() == count))
            .await;
    }

    async fn wait_consent(&mut self, from: &str) {
        self.next_event(|e| matches!(e, PresenterEvent::ConsentRequested { peer_id } if peer_id == from))
            .await;
    }

    async fn wait_notification(&mut self, expected: Notification) {
        self.next_event(|e| *e == PresenterEvent::Notification(expected.clone()))
            .await;
    }

    async fn wait_state(&self, state: CallState) {
        tokio::time::timeout(WAIT, self.client.negotiator().wait_for_state(state))
            .await
            .expect("timed out waiting for call state")
            .expect("negotiator stopped");
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Two clients that see each other online.
async fn pair(relay: &Arc<Relay>) -> (Peer, Peer) {
    let mut alice = Peer::join(relay, "alice").await;
    let mut bob = Peer::join(relay, "bob").await;
    alice.wait_online(1).await;
    bob.wait_online(1).await;
    (alice, bob)
}

/// Alice calls Bob and Bob accepts; both end up communicating.
async fn establish(alice: &mut Peer, bob: &mut Peer) {
    alice.client.call(bob.id());
    bob.wait_consent(&alice.id()).await;
    bob.client.accept();

    alice.wait_state(CallState::Communicating).await;
    bob.wait_state(CallState::Communicating).await;
}

// =============================================================================
// Flows
// =============================================================================

#[tokio::test]
async fn test_call_reaches_communicating() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;

    establish(&mut alice, &mut bob).await;

    let alice_pc = alice.factory.last().unwrap();
    let bob_pc = bob.factory.last().unwrap();
    eventually(|| alice_pc.calls().contains(&"set_remote".to_string())).await;
    assert_eq!(
        alice_pc.calls(),
        vec!["add_media:2", "create_offer", "set_local", "set_remote"]
    );
    assert_eq!(
        bob_pc.calls(),
        vec!["set_remote", "add_media:2", "create_answer", "set_local"]
    );

    assert_eq!(
        relay.forwarded_types().await,
        vec![
            SignalType::RequestVideo,
            SignalType::CanAccept,
            SignalType::Offer,
            SignalType::Answer,
        ]
    );
    let forwarded = relay.forwarded.lock().await.clone();
    assert_eq!(forwarded[2].value, MOCK_OFFER);
    assert_eq!(forwarded[3].value, MOCK_ANSWER);
}

#[tokio::test]
async fn test_candidates_cross_between_peers() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;
    establish(&mut alice, &mut bob).await;

    let alice_pc = alice.factory.last().unwrap();
    let bob_pc = bob.factory.last().unwrap();
    alice_pc
        .events()
        .ice_candidate(r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}"#.into());

    eventually(|| {
        bob_pc
            .calls()
            .iter()
            .any(|c| c.starts_with("add_candidate:") && c.contains("10.0.0.1"))
    })
    .await;
}

#[tokio::test]
async fn test_declined_call() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;

    alice.client.call(bob.id());
    bob.wait_consent(&alice.id()).await;
    bob.client.deny();

    alice.wait_notification(Notification::PeerDenied).await;
    alice.wait_state(CallState::Idle).await;
    bob.wait_state(CallState::Idle).await;
    assert!(alice.factory.connections().is_empty());
    assert!(bob.factory.connections().is_empty());
}

#[tokio::test]
async fn test_third_caller_gets_busy() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;
    let mut carol = Peer::join(&relay, "carol").await;
    carol.wait_online(2).await;

    establish(&mut alice, &mut bob).await;

    carol.client.call(bob.id());
    carol.wait_notification(Notification::PeerBusy).await;
    carol.wait_state(CallState::Idle).await;
    assert_eq!(bob.client.negotiator().state(), CallState::Communicating);
}

#[tokio::test]
async fn test_hang_up_ends_call_on_both_sides() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;
    establish(&mut alice, &mut bob).await;

    alice.client.hang_up();
    bob.wait_notification(Notification::HungUp).await;
    alice.wait_state(CallState::Idle).await;
    bob.wait_state(CallState::Idle).await;

    let alice_pc = alice.factory.last().unwrap();
    let bob_pc = bob.factory.last().unwrap();
    eventually(|| alice_pc.is_closed() && bob_pc.is_closed()).await;

    let media = [alice.media.clone(), bob.media.clone()];
    eventually(move || {
        media
            .iter()
            .all(|m| m.tracks().iter().all(|track| track.is_stopped()))
    })
    .await;
}

#[tokio::test]
async fn test_peer_disconnect_ends_call() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;
    establish(&mut alice, &mut bob).await;

    bob.client.shutdown().await;

    alice.wait_notification(Notification::HungUp).await;
    alice.wait_state(CallState::Idle).await;
}

#[tokio::test]
async fn test_media_refusal_reported_to_both() {
    let relay = Relay::new();
    let mut alice = Peer::join_with(&relay, "alice", MockMedia::deny()).await;
    let mut bob = Peer::join(&relay, "bob").await;
    alice.wait_online(1).await;

    alice.client.call(bob.id());
    bob.wait_consent(&alice.id()).await;
    bob.client.accept();

    alice.wait_notification(Notification::PermissionDenied).await;
    bob.wait_notification(Notification::PeerDenied).await;
    bob.wait_state(CallState::Idle).await;
}

#[tokio::test]
async fn test_simultaneous_calls_resolve_to_one() {
    let relay = Relay::new();
    let (mut alice, mut bob) = pair(&relay).await;

    alice.client.call(bob.id());
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.client.call(alice.id());

    // Alice asked first, so Bob yields and is asked for consent
    bob.wait_consent(&alice.id()).await;
    bob.client.accept();
    alice.wait_state(CallState::Communicating).await;
    bob.wait_state(CallState::Communicating).await;
}

#[tokio::test]
async fn test_chat_through_relay() {
    let relay = Relay::new();
    let (alice, mut bob) = pair(&relay).await;

    alice.client.send_chat(bob.id(), "hello bob").await.unwrap();

    let event = bob
        .next_event(|e| matches!(e, PresenterEvent::Chat { .. }))
        .await;
    assert_eq!(
        event,
        PresenterEvent::Chat {
            from: alice.id(),
            text: "hello bob".into()
        }
    );
}
