//! Presentation contract.
//!
//! The client core reports everything the user should see through a
//! [`Presenter`]. Methods are synchronous and must not block; implementations
//! forward to whatever drives the display.

use protocol::UserId;
use tokio::sync::mpsc;

use crate::call::{CallState, Notification, TrackKind};

/// A client known to be online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: UserId,
    pub name: String,
}

/// Receives user-visible events.
pub trait Presenter: Send + Sync {
    /// The negotiation moved to `state`; `peer_id` is set unless idle.
    fn state_changed(&self, state: CallState, peer_id: Option<&str>);

    /// A peer asked for a call. Answer with accept or deny on the
    /// negotiator handle.
    fn consent_requested(&self, peer_id: &str);

    fn notify(&self, notification: &Notification);

    fn remote_track(&self, peer_id: &str, kind: TrackKind);

    fn chat(&self, _from: &str, _text: &str) {}

    /// The roster changed; `contacts` is the full list, sorted by id.
    fn roster_changed(&self, _contacts: &[Contact]) {}
}

/// Owned form of every [`Presenter`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterEvent {
    StateChanged {
        state: CallState,
        peer_id: Option<UserId>,
    },
    ConsentRequested {
        peer_id: UserId,
    },
    Notification(Notification),
    RemoteTrack {
        peer_id: UserId,
        kind: TrackKind,
    },
    Chat {
        from: UserId,
        text: String,
    },
    Roster(Vec<Contact>),
}

/// Presenter that forwards every call as a [`PresenterEvent`].
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<PresenterEvent>,
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: PresenterEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("presenter receiver dropped");
        }
    }
}

impl Presenter for ChannelPresenter {
    fn state_changed(&self, state: CallState, peer_id: Option<&str>) {
        self.emit(PresenterEvent::StateChanged {
            state,
            peer_id: peer_id.map(str::to_owned),
        });
    }

    fn consent_requested(&self, peer_id: &str) {
        self.emit(PresenterEvent::ConsentRequested {
            peer_id: peer_id.to_owned(),
        });
    }

    fn notify(&self, notification: &Notification) {
        self.emit(PresenterEvent::Notification(notification.clone()));
    }

    fn remote_track(&self, peer_id: &str, kind: TrackKind) {
        self.emit(PresenterEvent::RemoteTrack {
            peer_id: peer_id.to_owned(),
            kind,
        });
    }

    fn chat(&self, from: &str, text: &str) {
        self.emit(PresenterEvent::Chat {
            from: from.to_owned(),
            text: text.to_owned(),
        });
    }

    fn roster_changed(&self, contacts: &[Contact]) {
        self.emit(PresenterEvent::Roster(contacts.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_presenter_forwards_in_order() {
        let (presenter, mut rx) = ChannelPresenter::new();

        presenter.state_changed(CallState::Thinking, Some("2"));
        presenter.consent_requested("2");
        presenter.notify(&Notification::PeerBusy);
        presenter.chat("2", "hi");

        assert_eq!(
            rx.try_recv().unwrap(),
            PresenterEvent::StateChanged {
                state: CallState::Thinking,
                peer_id: Some("2".into())
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenterEvent::ConsentRequested { peer_id: "2".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenterEvent::Notification(Notification::PeerBusy)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PresenterEvent::Chat {
                from: "2".into(),
                text: "hi".into()
            }
        );
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (presenter, rx) = ChannelPresenter::new();
        drop(rx);
        presenter.notify(&Notification::HungUp);
    }
}
