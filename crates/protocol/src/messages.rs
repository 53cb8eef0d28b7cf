//! Application message definitions for the Nobody Chat relay.
//!
//! Every application message travels as a JSON envelope of the form
//! `{"msg_type": {"<kind>": <payload>}}` where exactly one kind is present.
//! Call negotiation rides inside the `signal` kind as a [`SignalInfo`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Opaque identity assigned by the relay, unique per connected client.
pub type UserId = String;

/// Key under which the message union is stored in an envelope.
const ENVELOPE_FIELD: &str = "msg_type";

/// Envelope wrapper for all application messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The single populated message kind.
    pub msg_type: Message,
}

impl Envelope {
    /// Wrap a message in an envelope.
    pub fn new(msg_type: Message) -> Self {
        Self { msg_type }
    }

    /// Serialize the envelope to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope from JSON.
    ///
    /// The `msg_type` object must contain exactly one known kind; anything
    /// else is a [`ProtocolError::MalformedEnvelope`].
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("not JSON: {e}")))?;

        let union = value
            .get(ENVELOPE_FIELD)
            .and_then(serde_json::Value::as_object)
            .ok_or_else(|| {
                ProtocolError::MalformedEnvelope(format!("missing `{ENVELOPE_FIELD}` object"))
            })?;

        if union.len() != 1 {
            return Err(ProtocolError::MalformedEnvelope(format!(
                "expected exactly one message kind, found {}",
                union.len()
            )));
        }

        let msg_type = serde_json::from_value(serde_json::Value::Object(union.clone()))
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;

        Ok(Self { msg_type })
    }
}

impl From<Message> for Envelope {
    fn from(msg_type: Message) -> Self {
        Self::new(msg_type)
    }
}

/// Tagged union of every message kind the relay understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Message {
    // Presence (relay to client)
    /// Identity the relay assigned to this connection.
    SetUser {
        /// Assigned identity.
        id: UserId,
        /// Display name.
        name: String,
    },
    /// Another client joined.
    UserOnline {
        /// Identity of the client.
        id: UserId,
        /// Display name.
        name: String,
    },
    /// Another client left.
    UserOffline {
        /// Identity of the client.
        id: UserId,
        /// Display name, when the relay sends one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A client changed its display name.
    SetName {
        /// Identity of the client.
        id: UserId,
        /// New display name.
        name: String,
    },

    // Chat
    /// Chat text delivered by the relay.
    Msg {
        /// Sender identity.
        from: UserId,
        /// Message text.
        msg: String,
    },
    /// Chat text addressed to another client (client to relay).
    TalkTo {
        /// Recipient identity.
        to: UserId,
        /// Message text.
        msg: String,
    },

    // Negotiation
    /// Call negotiation signal, forwarded verbatim by the relay.
    Signal(SignalInfo),
}

impl Message {
    /// The kind of this message, used for handler registration.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SetUser { .. } => MessageKind::SetUser,
            Message::UserOnline { .. } => MessageKind::UserOnline,
            Message::UserOffline { .. } => MessageKind::UserOffline,
            Message::SetName { .. } => MessageKind::SetName,
            Message::Msg { .. } => MessageKind::Msg,
            Message::TalkTo { .. } => MessageKind::TalkTo,
            Message::Signal(_) => MessageKind::Signal,
        }
    }
}

/// Discriminant of [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SetUser,
    UserOnline,
    UserOffline,
    SetName,
    Msg,
    TalkTo,
    Signal,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::SetUser => "setUser",
            MessageKind::UserOnline => "userOnline",
            MessageKind::UserOffline => "userOffline",
            MessageKind::SetName => "setName",
            MessageKind::Msg => "msg",
            MessageKind::TalkTo => "talkTo",
            MessageKind::Signal => "signal",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Negotiation step carried by a [`SignalInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalType {
    /// Ask the peer for a call; value is the request time in ms.
    RequestVideo,
    /// The callee consented; the caller should send an offer.
    CanAccept,
    /// The peer is already in another negotiation.
    Busying,
    /// Our request predates the peer's; the peer should yield.
    RequestedFirst,
    /// SDP offer JSON.
    Offer,
    /// SDP answer JSON.
    Answer,
    /// ICE candidate JSON.
    NewCandidate,
    /// The request or call was declined.
    Deny,
    /// The call was hung up.
    Stop,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalType::RequestVideo => "requestVideo",
            SignalType::CanAccept => "canAccept",
            SignalType::Busying => "busying",
            SignalType::RequestedFirst => "requestedFirst",
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::NewCandidate => "newCandidate",
            SignalType::Deny => "deny",
            SignalType::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// A single negotiation message between two clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalInfo {
    /// Sender identity.
    pub from_id: UserId,
    /// Recipient identity.
    pub to_id: UserId,
    /// Negotiation step.
    pub signal_type: SignalType,
    /// Step-dependent payload; empty when unused.
    pub value: String,
}

impl SignalInfo {
    /// Create a new signal.
    pub fn new(
        from_id: impl Into<UserId>,
        to_id: impl Into<UserId>,
        signal_type: SignalType,
        value: impl Into<String>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            signal_type,
            value: value.into(),
        }
    }

    /// Build a reply travelling in the opposite direction.
    pub fn reply(&self, signal_type: SignalType, value: impl Into<String>) -> Self {
        Self::new(self.to_id.clone(), self.from_id.clone(), signal_type, value)
    }
}

impl From<SignalInfo> for Message {
    fn from(signal: SignalInfo) -> Self {
        Message::Signal(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_wire_format() {
        let envelope = Envelope::new(Message::Signal(SignalInfo::new(
            "a",
            "b",
            SignalType::NewCandidate,
            "{}",
        )));
        let json: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "msg_type": {
                    "signal": {
                        "from_id": "a",
                        "to_id": "b",
                        "signal_type": "newCandidate",
                        "value": "{}"
                    }
                }
            })
        );
    }

    #[test]
    fn test_parse_set_user() {
        let envelope =
            Envelope::from_json(r#"{"msg_type":{"setUser":{"id":"42","name":"amber"}}}"#)
                .unwrap();
        assert_eq!(
            envelope.msg_type,
            Message::SetUser {
                id: "42".into(),
                name: "amber".into()
            }
        );
        assert_eq!(envelope.msg_type.kind(), MessageKind::SetUser);
    }

    #[test]
    fn test_user_offline_without_name() {
        let envelope = Envelope::from_json(r#"{"msg_type":{"userOffline":{"id":"7"}}}"#).unwrap();
        assert_eq!(
            envelope.msg_type,
            Message::UserOffline {
                id: "7".into(),
                name: None
            }
        );
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"msg_type":{"userOffline":{"id":"7"}}}"#
        );
    }

    #[test]
    fn test_talk_to_serializes_camel_case() {
        let envelope = Envelope::new(Message::TalkTo {
            to: "b".into(),
            msg: "hi".into(),
        });
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"msg_type":{"talkTo":{"to":"b","msg":"hi"}}}"#
        );
    }

    #[test]
    fn test_all_signal_types_parse() {
        let names = [
            ("requestVideo", SignalType::RequestVideo),
            ("canAccept", SignalType::CanAccept),
            ("busying", SignalType::Busying),
            ("requestedFirst", SignalType::RequestedFirst),
            ("offer", SignalType::Offer),
            ("answer", SignalType::Answer),
            ("newCandidate", SignalType::NewCandidate),
            ("deny", SignalType::Deny),
            ("stop", SignalType::Stop),
        ];
        for (name, expected) in names {
            let parsed: SignalType = serde_json::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(expected.to_string(), name);
        }
    }

    #[test]
    fn test_zero_kinds_is_malformed() {
        let err = Envelope::from_json(r#"{"msg_type":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_two_kinds_is_malformed() {
        let err = Envelope::from_json(
            r#"{"msg_type":{"setUser":{"id":"1","name":"x"},"userOffline":{"id":"2"}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let err = Envelope::from_json(r#"{"msg_type":{"launch":{}}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedEnvelope(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_msg_type_is_malformed() {
        for text in [r#"{"other":1}"#, r#"{"msg_type":"signal"}"#, "not json"] {
            let err = Envelope::from_json(text).unwrap_err();
            assert!(matches!(err, ProtocolError::MalformedEnvelope(_)), "{text}");
        }
    }

    #[test]
    fn test_reply_swaps_direction() {
        let request = SignalInfo::new("b", "a", SignalType::RequestVideo, "5");
        let reply = request.reply(SignalType::CanAccept, "");
        assert_eq!(reply.from_id, "a");
        assert_eq!(reply.to_id, "b");
        assert_eq!(reply.signal_type, SignalType::CanAccept);
        assert!(reply.value.is_empty());
    }
}
