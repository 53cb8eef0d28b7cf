//! Client orchestrator.
//!
//! [`CallClient`] connects to the relay, completes the key exchange, waits
//! for the relay to assign an identity, then wires
//! receive loop → signal router → negotiator / roster / presenter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use protocol::{Envelope, Message, MessageKind, UserId};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call::negotiator::DEFAULT_REQUEST_TIMEOUT;
use crate::call::webrtc::{DeniedMedia, SyntheticMedia, WebRtcConfig, WebRtcPeerFactory};
use crate::call::{CallNegotiator, MediaSource, NegotiatorHandle, PeerConnectionFactory};
use crate::config::Config;
use crate::network::{connect_websocket, open_secure_channel, RawChannel, SecureReceiver, SecureSender};
use crate::presenter::{Contact, Presenter};
use crate::router::{DispatchQueue, SignalRouter};

/// Timeouts used while starting a client.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Bound on the key exchange and on the wait for `setUser`.
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            handshake_timeout: config.relay.handshake_timeout(),
            request_timeout: config.call.request_timeout(),
        }
    }
}

/// Online clients, keyed by id.
#[derive(Debug, Default)]
struct Roster {
    contacts: BTreeMap<UserId, String>,
}

impl Roster {
    fn snapshot(&self) -> Vec<Contact> {
        self.contacts
            .iter()
            .map(|(id, name)| Contact {
                id: id.clone(),
                name: name.clone(),
            })
            .collect()
    }
}

/// A client connected to the relay.
pub struct CallClient {
    local_id: UserId,
    local_name: String,
    sender: SecureSender,
    negotiator: NegotiatorHandle,
    roster: Arc<RwLock<Roster>>,
    cancel: CancellationToken,
    receive_task: JoinHandle<()>,
}

impl CallClient {
    /// Connect to the configured relay with the webrtc-rs adapters.
    pub async fn connect(config: &Config, presenter: Arc<dyn Presenter>) -> Result<Self> {
        let channel = connect_websocket(&config.relay.url)
            .await
            .with_context(|| format!("failed to connect to relay at {}", config.relay.url))?;

        let factory = Arc::new(WebRtcPeerFactory::new(WebRtcConfig::with_ice_servers(
            config.ice.servers.clone(),
        )));
        let media: Arc<dyn MediaSource> = if config.call.allow_media {
            Arc::new(SyntheticMedia)
        } else {
            Arc::new(DeniedMedia)
        };

        Self::start(channel, ClientOptions::from(config), factory, media, presenter).await
    }

    /// Start a client over an already-open raw channel.
    pub async fn start(
        channel: RawChannel,
        options: ClientOptions,
        factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaSource>,
        presenter: Arc<dyn Presenter>,
    ) -> Result<Self> {
        let (sender, mut receiver) = open_secure_channel(channel, options.handshake_timeout)
            .await
            .context("key exchange with relay failed")?;

        let (local_id, local_name, early) =
            tokio::time::timeout(options.handshake_timeout, await_identity(&mut receiver))
                .await
                .context("relay did not assign an identity in time")??;

        info!(id = %local_id, name = %local_name, "registered with relay");

        let negotiator = CallNegotiator::new(
            local_id.clone(),
            Arc::new(sender.clone()),
            factory,
            media,
            presenter.clone(),
        )
        .with_request_timeout(options.request_timeout)
        .spawn();

        let roster = Arc::new(RwLock::new(Roster::default()));
        let router = SignalRouter::new();
        register_handlers(&router, &local_id, &negotiator, &roster, &presenter).await;

        let (queue, _dispatcher) = router.spawn_dispatcher();
        for envelope in early {
            let _ = queue.push(envelope);
        }

        let cancel = CancellationToken::new();
        let receive_task = tokio::spawn(receive_loop(
            receiver,
            sender.clone(),
            queue,
            negotiator.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            local_id,
            local_name,
            sender,
            negotiator,
            roster,
            cancel,
            receive_task,
        })
    }

    /// Identity assigned by the relay.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn negotiator(&self) -> &NegotiatorHandle {
        &self.negotiator
    }

    /// Online clients other than this one, sorted by id.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.roster.read().await.snapshot()
    }

    pub fn call(&self, peer_id: impl Into<UserId>) {
        self.negotiator.call(peer_id);
    }

    pub fn accept(&self) {
        self.negotiator.accept();
    }

    pub fn deny(&self) {
        self.negotiator.deny();
    }

    pub fn hang_up(&self) {
        self.negotiator.hang_up();
    }

    /// Send a chat message through the relay.
    pub async fn send_chat(&self, to: impl Into<UserId>, text: impl Into<String>) -> Result<()> {
        let envelope = Envelope::new(Message::TalkTo {
            to: to.into(),
            msg: text.into(),
        });
        self.sender
            .send_envelope(&envelope)
            .await
            .context("failed to send chat message")
    }

    /// Whether the relay connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.receive_task.is_finished()
    }

    /// Wait until the relay connection ends.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Hang up, stop the negotiator and drop the relay connection.
    pub async fn shutdown(self) {
        info!(id = %self.local_id, "shutting down client");
        self.negotiator.shutdown();
        self.cancel.cancel();
        if let Err(e) = self.receive_task.await {
            debug!(error = %e, "receive task ended abnormally");
        }
    }
}

/// Read envelopes until `setUser`, keeping anything that arrived first.
async fn await_identity(receiver: &mut SecureReceiver) -> Result<(UserId, String, Vec<Envelope>)> {
    let mut early = Vec::new();
    loop {
        match receiver.next_envelope().await? {
            Some(Envelope {
                msg_type: Message::SetUser { id, name },
            }) => return Ok((id, name, early)),
            Some(envelope) => {
                debug!(kind = %envelope.msg_type.kind(), "envelope before setUser, holding");
                early.push(envelope);
            }
            None => bail!("relay closed the connection before assigning an identity"),
        }
    }
}

async fn register_handlers(
    router: &SignalRouter,
    local_id: &str,
    negotiator: &NegotiatorHandle,
    roster: &Arc<RwLock<Roster>>,
    presenter: &Arc<dyn Presenter>,
) {
    let handle = negotiator.clone();
    router
        .register_handler(MessageKind::Signal, move |message| {
            if let Message::Signal(signal) = message {
                handle.signal(signal);
            }
            async {}
        })
        .await;

    let (roster_ref, presenter_ref, self_id) = (roster.clone(), presenter.clone(), local_id.to_owned());
    router
        .register_handler(MessageKind::UserOnline, move |message| {
            let (roster, presenter, self_id) = (roster_ref.clone(), presenter_ref.clone(), self_id.clone());
            async move {
                if let Message::UserOnline { id, name } = message {
                    if id == self_id {
                        return;
                    }
                    debug!(%id, %name, "user online");
                    let mut roster = roster.write().await;
                    roster.contacts.insert(id, name);
                    presenter.roster_changed(&roster.snapshot());
                }
            }
        })
        .await;

    let (roster_ref, presenter_ref) = (roster.clone(), presenter.clone());
    router
        .register_handler(MessageKind::SetName, move |message| {
            let (roster, presenter) = (roster_ref.clone(), presenter_ref.clone());
            async move {
                if let Message::SetName { id, name } = message {
                    let mut roster = roster.write().await;
                    if let Some(entry) = roster.contacts.get_mut(&id) {
                        debug!(%id, %name, "user renamed");
                        *entry = name;
                        presenter.roster_changed(&roster.snapshot());
                    }
                }
            }
        })
        .await;

    let (roster_ref, presenter_ref, handle) = (roster.clone(), presenter.clone(), negotiator.clone());
    router
        .register_handler(MessageKind::UserOffline, move |message| {
            let (roster, presenter, handle) = (roster_ref.clone(), presenter_ref.clone(), handle.clone());
            async move {
                if let Message::UserOffline { id, .. } = message {
                    debug!(%id, "user offline");
                    let mut roster = roster.write().await;
                    roster.contacts.remove(&id);
                    presenter.roster_changed(&roster.snapshot());
                    handle.peer_offline(id);
                }
            }
        })
        .await;

    let presenter_ref = presenter.clone();
    router
        .register_handler(MessageKind::Msg, move |message| {
            if let Message::Msg { from, msg } = message {
                presenter_ref.chat(&from, &msg);
            }
            async {}
        })
        .await;

    router
        .register_handler(MessageKind::SetUser, |message| {
            if let Message::SetUser { id, .. } = message {
                warn!(%id, "relay reassigned identity, ignoring");
            }
            async {}
        })
        .await;
}

async fn receive_loop(
    mut receiver: SecureReceiver,
    sender: SecureSender,
    queue: DispatchQueue,
    negotiator: NegotiatorHandle,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.next_envelope() => next,
        };

        match next {
            Ok(Some(envelope)) => {
                if queue.push(envelope).is_err() {
                    warn!("dispatcher stopped, closing connection");
                    break;
                }
            }
            Ok(None) => {
                info!("relay closed the connection");
                break;
            }
            Err(e) => {
                error!(error = %e, "relay connection failed");
                if e.is_fatal() {
                    // Nothing may be sealed on a channel whose peer failed to authenticate
                    sender.close().await;
                }
                break;
            }
        }
    }

    negotiator.shutdown();
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::testing::{MockMedia, MockPeerFactory};
    use crate::network::memory_pair;
    use crate::presenter::{ChannelPresenter, PresenterEvent};
    use protocol::{KeyExchange, SignalInfo, SignalType};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    /// The relay side of a single connection.
    struct FakeRelay {
        tx: SecureSender,
        rx: SecureReceiver,
    }

    impl FakeRelay {
        async fn send(&self, message: Message) {
            self.tx.send_envelope(&Envelope::new(message)).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            tokio::time::timeout(WAIT, self.rx.next_envelope())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
                .msg_type
        }
    }

    async fn connected(
        before_identity: Vec<Message>,
    ) -> (CallClient, FakeRelay, mpsc::UnboundedReceiver<PresenterEvent>) {
        let (client_side, relay_side) = memory_pair();
        let (presenter, events) = ChannelPresenter::new();

        let relay = tokio::spawn(async move {
            let (tx, rx) = open_secure_channel(relay_side, WAIT).await.unwrap();
            let relay = FakeRelay { tx, rx };
            for message in before_identity {
                relay.send(message).await;
            }
            relay
                .send(Message::SetUser {
                    id: "1".into(),
                    name: "alice".into(),
                })
                .await;
            relay
        });

        let client = CallClient::start(
            client_side,
            ClientOptions::default(),
            Arc::new(MockPeerFactory::new()),
            Arc::new(MockMedia::allow()),
            Arc::new(presenter),
        )
        .await
        .unwrap();

        (client, relay.await.unwrap(), events)
    }

    async fn next_roster(events: &mut mpsc::UnboundedReceiver<PresenterEvent>) -> Vec<Contact> {
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let PresenterEvent::Roster(contacts) = event {
                return contacts;
            }
        }
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.relay.handshake_timeout_secs = 3;
        config.call.request_timeout_secs = 45;

        let options = ClientOptions::from(&config);
        assert_eq!(options.handshake_timeout, Duration::from_secs(3));
        assert_eq!(options.request_timeout, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_identity_assigned_by_relay() {
        let (client, _relay, _events) = connected(vec![]).await;
        assert_eq!(client.local_id(), "1");
        assert_eq!(client.local_name(), "alice");
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_roster_tracks_presence() {
        let (client, relay, mut events) = connected(vec![]).await;

        relay
            .send(Message::UserOnline {
                id: "2".into(),
                name: "bob".into(),
            })
            .await;
        assert_eq!(next_roster(&mut events).await.len(), 1);

        relay
            .send(Message::SetName {
                id: "2".into(),
                name: "robert".into(),
            })
            .await;
        assert_eq!(
            next_roster(&mut events).await,
            vec![Contact {
                id: "2".into(),
                name: "robert".into()
            }]
        );

        relay
            .send(Message::UserOffline {
                id: "2".into(),
                name: None,
            })
            .await;
        assert!(next_roster(&mut events).await.is_empty());
        assert!(client.contacts().await.is_empty());
    }

    #[tokio::test]
    async fn test_presence_before_identity_is_kept() {
        let (client, _relay, mut events) = connected(vec![Message::UserOnline {
            id: "3".into(),
            name: "carol".into(),
        }])
        .await;

        assert_eq!(next_roster(&mut events).await.len(), 1);
        assert_eq!(client.contacts().await[0].name, "carol");
    }

    #[tokio::test]
    async fn test_chat_in_and_out() {
        let (client, mut relay, mut events) = connected(vec![]).await;

        client.send_chat("2", "hello").await.unwrap();
        assert_eq!(
            relay.recv().await,
            Message::TalkTo {
                to: "2".into(),
                msg: "hello".into()
            }
        );

        relay
            .send(Message::Msg {
                from: "2".into(),
                msg: "hi back".into(),
            })
            .await;
        loop {
            if let PresenterEvent::Chat { from, text } = events.recv().await.unwrap() {
                assert_eq!(from, "2");
                assert_eq!(text, "hi back");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_signals_reach_negotiator() {
        let (client, mut relay, _events) = connected(vec![]).await;

        client.call("2");
        match relay.recv().await {
            Message::Signal(signal) => {
                assert_eq!(signal.signal_type, SignalType::RequestVideo);
                assert_eq!(signal.from_id, "1");
            }
            other => panic!("unexpected {other:?}"),
        }

        relay
            .send(Message::Signal(SignalInfo::new("2", "1", SignalType::Busying, "")))
            .await;
        tokio::time::timeout(
            WAIT,
            client
                .negotiator()
                .wait_for(|s| s.state == crate::call::CallState::Idle && s.generation == 2),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_peer_offline_hangs_up_call() {
        let (client, relay, mut events) = connected(vec![]).await;

        relay
            .send(Message::Signal(SignalInfo::new("2", "1", SignalType::RequestVideo, "9")))
            .await;
        tokio::time::timeout(
            WAIT,
            client.negotiator().wait_for_state(crate::call::CallState::Thinking),
        )
        .await
        .unwrap();

        relay
            .send(Message::UserOffline {
                id: "2".into(),
                name: None,
            })
            .await;
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if event == PresenterEvent::Notification(crate::call::Notification::HungUp) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_relay_disconnect_closes_client() {
        let (client, relay, _events) = connected(vec![]).await;
        drop(relay);
        tokio::time::timeout(WAIT, client.closed()).await.unwrap();
        assert!(!client.negotiator().is_running());
    }

    #[tokio::test]
    async fn test_undecryptable_frame_closes_both_directions() {
        let (client_side, relay_side) = memory_pair();
        let (relay_tx, mut relay_rx) = relay_side.split();

        let relay = tokio::spawn(async move {
            let exchange = KeyExchange::new();
            let client_key = relay_rx.recv().await.unwrap();
            relay_tx.send(exchange.public_key_message()).await.unwrap();
            let mut cipher = exchange.finish(&client_key).unwrap();

            let set_user = Envelope::new(Message::SetUser {
                id: "1".into(),
                name: "alice".into(),
            });
            relay_tx
                .send(cipher.encrypt(&set_user.to_json().unwrap()).unwrap())
                .await
                .unwrap();
            relay_tx.send("A".repeat(40)).await.unwrap();
            (relay_tx, relay_rx)
        });

        let client = CallClient::start(
            client_side,
            ClientOptions::default(),
            Arc::new(MockPeerFactory::new()),
            Arc::new(MockMedia::allow()),
            Arc::new(ChannelPresenter::new().0),
        )
        .await
        .unwrap();
        let (_relay_tx, mut relay_rx) = relay.await.unwrap();

        tokio::time::timeout(WAIT, client.closed()).await.unwrap();
        assert!(client.send_chat("2", "after failure").await.is_err());

        // The outbound transport is released without another frame on it
        let next = tokio::time::timeout(WAIT, relay_rx.recv()).await.unwrap();
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn test_relay_closes_before_identity() {
        let (client_side, relay_side) = memory_pair();
        let relay = tokio::spawn(async move {
            let _ = open_secure_channel(relay_side, WAIT).await.unwrap();
        });

        let result = CallClient::start(
            client_side,
            ClientOptions::default(),
            Arc::new(MockPeerFactory::new()),
            Arc::new(MockMedia::allow()),
            Arc::new(ChannelPresenter::new().0),
        )
        .await;
        relay.await.unwrap();
        assert!(result.is_err());
    }
}
