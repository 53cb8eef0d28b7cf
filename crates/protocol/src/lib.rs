//! # Nobody Chat Protocol Library
//!
//! This crate provides the wire formats and cryptographic primitives for the
//! Nobody Chat relay signaling channel.
//!
//! ## Overview
//!
//! Clients talk to each other through a relay that forwards JSON envelopes.
//! After a one-message-per-direction key exchange every envelope is sealed,
//! so the relay only ever sees ciphertext. This crate provides:
//!
//! - **Message Definitions**: the `msg_type` envelope and the call-negotiation signals
//! - **Key Exchange**: ephemeral X25519 with HKDF-SHA256 per-direction keys
//! - **Session Cipher**: ChaCha20-Poly1305 with counter nonces and replay rejection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  JSON envelopes
//! ├─────────────────────────────────────────┤
//! │            Session Cipher               │  ChaCha20-Poly1305, seq nonce
//! ├─────────────────────────────────────────┤
//! │             Key Exchange                │  X25519 + HKDF-SHA256
//! ├─────────────────────────────────────────┤
//! │        Transport (WebSocket text)       │  base64 frames
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, KeyExchange, Message, SignalInfo, SignalType};
//!
//! // Both sides generate an ephemeral key and swap public keys
//! let alice = KeyExchange::new();
//! let bob = KeyExchange::new();
//! let (alice_pk, bob_pk) = (alice.public_key_message(), bob.public_key_message());
//! let mut alice = alice.finish(&bob_pk).unwrap();
//! let mut bob = bob.finish(&alice_pk).unwrap();
//!
//! // Seal a call request
//! let signal = SignalInfo::new("alice", "bob", SignalType::RequestVideo, "1700000000000");
//! let frame = alice.encrypt(&Envelope::new(Message::Signal(signal)).to_json().unwrap()).unwrap();
//!
//! // Open it on the other side
//! let envelope = Envelope::from_json(&bob.decrypt(&frame).unwrap()).unwrap();
//! assert!(matches!(envelope.msg_type, Message::Signal(_)));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Envelope and signal definitions
//! - [`handshake`]: X25519 key exchange
//! - [`cipher`]: Session cipher
//! - [`error`]: Error types

pub mod cipher;
pub mod error;
pub mod handshake;
pub mod messages;

pub use cipher::{OpeningKey, SealingKey, SessionCipher, FRAME_OVERHEAD, KEY_LEN};
pub use error::{ProtocolError, Result};
pub use handshake::{decode_public_key, KeyExchange, PUBLIC_KEY_LEN};
pub use messages::{Envelope, Message, MessageKind, SignalInfo, SignalType, UserId};
