//! Network module for the relay connection.
//!
//! This module provides:
//! - A text-frame [`RawChannel`] abstraction over the relay socket
//! - A WebSocket implementation of it (tokio-tungstenite)
//! - An in-memory pair for tests and loopback use
//! - The [`secure`] layer that runs the key exchange and seals every frame

pub mod memory;
pub mod secure;
pub mod websocket;

use protocol::error::{ProtocolError, Result};
use tokio::sync::mpsc;

/// Buffer size of the channels bridging socket tasks and their users.
pub const CHANNEL_CAPACITY: usize = 256;

/// Reliable, ordered, bidirectional channel of text frames.
///
/// Transports spawn their own I/O tasks and hand back the two ends of the
/// bridging channels. A closed receiver means the connection is gone.
#[derive(Debug)]
pub struct RawChannel {
    sender: RawSender,
    receiver: RawReceiver,
}

impl RawChannel {
    /// Build a channel from its bridging halves.
    pub fn new(outgoing: mpsc::Sender<String>, incoming: mpsc::Receiver<String>) -> Self {
        Self {
            sender: RawSender { tx: outgoing },
            receiver: RawReceiver { rx: incoming },
        }
    }

    /// Separate the sending and receiving halves.
    pub fn split(self) -> (RawSender, RawReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`RawChannel`]. Dropping it closes the connection.
#[derive(Debug, Clone)]
pub struct RawSender {
    tx: mpsc::Sender<String>,
}

impl RawSender {
    /// Queue one text frame for sending.
    pub async fn send(&self, frame: String) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("raw channel closed".to_string()))
    }

    /// Whether the transport has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`RawChannel`].
#[derive(Debug)]
pub struct RawReceiver {
    rx: mpsc::Receiver<String>,
}

impl RawReceiver {
    /// Next text frame, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

// Re-export key types
pub use memory::memory_pair;
pub use secure::{open_secure_channel, SecureReceiver, SecureSender};
pub use websocket::connect_websocket;
