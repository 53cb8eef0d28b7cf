//! # Nobody Chat call client
//!
//! Client side of the nobody-chat relay: an encrypted signaling channel to
//! the relay and the negotiation that sets up one-to-one WebRTC calls over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       CallClient                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  receive loop ──► SignalRouter ──► roster / presenter    │
//! │                        │                                 │
//! │                        ▼                                 │
//! │                  CallNegotiator ──► PeerConnection       │
//! │                        │              (webrtc-rs)        │
//! │                        ▼                                 │
//! │  SecureSender / SecureReceiver  (X25519 + ChaCha20)      │
//! │                        │                                 │
//! │  RawChannel  (WebSocket, or in-memory for tests)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use client::presenter::ChannelPresenter;
//! use client::{CallClient, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let (presenter, _events) = ChannelPresenter::new();
//!
//!     let client = CallClient::connect(&config, Arc::new(presenter)).await?;
//!     client.call("2");
//!
//!     client.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: Relay transports and the secure channel
//! - [`router`]: Per-kind dispatch of relay envelopes
//! - [`call`]: Negotiation state machine, driver and WebRTC adapter
//! - [`presenter`]: What the user gets to see
//! - [`orchestrator`]: Wires everything to a relay connection

pub mod call;
pub mod config;
pub mod network;
pub mod orchestrator;
pub mod presenter;
pub mod router;

// Re-export protocol for convenience
pub use protocol;

pub use call::{CallError, CallState, Notification, TrackKind};
pub use config::{Config, ConfigError};
pub use orchestrator::{CallClient, ClientOptions};
pub use presenter::{ChannelPresenter, Contact, Presenter, PresenterEvent};
pub use router::{RouterError, SignalRouter};
