//! Encrypted channel over a raw relay connection.
//!
//! [`open_secure_channel`] runs the one-message-per-direction key exchange
//! and returns a sender and a receiver that seal and open every later frame.
//! The exchange is symmetric, so the same function serves clients and the
//! relay.

use std::sync::Arc;
use std::time::Duration;

use protocol::error::{ProtocolError, Result};
use protocol::{Envelope, KeyExchange, OpeningKey, SealingKey};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{RawChannel, RawReceiver, RawSender};

/// Perform the key exchange and enter application mode.
///
/// The first inbound frame must be the peer's public key; anything else is a
/// [`ProtocolError::HandshakeFailed`]. The wait is bounded by `timeout`.
pub async fn open_secure_channel(
    channel: RawChannel,
    timeout: Duration,
) -> Result<(SecureSender, SecureReceiver)> {
    let (raw_tx, mut raw_rx) = channel.split();

    let exchange = KeyExchange::new();
    raw_tx.send(exchange.public_key_message()).await?;

    let peer_key = match tokio::time::timeout(timeout, raw_rx.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            return Err(ProtocolError::HandshakeFailed(
                "connection closed before the peer sent its public key".to_string(),
            ))
        }
        Err(_) => {
            return Err(ProtocolError::HandshakeFailed(format!(
                "no public key received within {}s",
                timeout.as_secs()
            )))
        }
    };

    let cipher = exchange.finish(&peer_key).map_err(|e| match e {
        ProtocolError::InvalidPublicKey(reason) => {
            ProtocolError::HandshakeFailed(format!("first frame is not a public key: {reason}"))
        }
        other => other,
    })?;
    let (sealing, opening) = cipher.split();

    tracing::debug!("key exchange complete");

    Ok((
        SecureSender::new(raw_tx, sealing),
        SecureReceiver {
            raw: raw_rx,
            opening,
        },
    ))
}

struct SenderInner {
    link: Mutex<Option<Link>>,
    closed: CancellationToken,
}

struct Link {
    raw: RawSender,
    sealing: SealingKey,
}

/// Sealing half of a secure channel. Cheap to clone.
///
/// All clones share one link. After [`SecureSender::close`] every clone
/// refuses to send and the raw sender and sealing key are dropped, which
/// releases the transport once the receiving half is gone too.
#[derive(Clone)]
pub struct SecureSender {
    inner: Arc<SenderInner>,
}

impl SecureSender {
    fn new(raw: RawSender, sealing: SealingKey) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                link: Mutex::new(Some(Link { raw, sealing })),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Seal and send one plaintext frame.
    pub async fn send(&self, plaintext: &str) -> Result<()> {
        // Held across the send so frames leave in sequence order
        let mut link = self.inner.link.lock().await;
        let Some(active) = link.as_mut() else {
            return Err(closed_error());
        };

        let frame = active.sealing.seal_text(plaintext)?;
        if let Err(e) = active.raw.send(frame).await {
            *link = None;
            self.inner.closed.cancel();
            return Err(e);
        }
        Ok(())
    }

    /// Serialize, seal and send an envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(&envelope.to_json()?).await
    }

    /// Stop sending for good.
    ///
    /// Waits for an in-flight send to finish, then drops the link. Later
    /// sends on any clone fail with [`ProtocolError::ConnectionClosed`].
    pub async fn close(&self) {
        self.inner.closed.cancel();
        if self.inner.link.lock().await.take().is_some() {
            tracing::debug!("secure sender closed");
        }
    }

    /// Whether the channel was closed, or a send found the transport gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

fn closed_error() -> ProtocolError {
    ProtocolError::ConnectionClosed("secure channel closed".to_string())
}

impl std::fmt::Debug for SecureSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSender")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opening half of a secure channel.
#[derive(Debug)]
pub struct SecureReceiver {
    raw: RawReceiver,
    opening: OpeningKey,
}

impl SecureReceiver {
    /// Next decrypted frame, or `None` once the connection is closed.
    ///
    /// Any decryption failure is returned as an error; the caller must close
    /// the connection.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        match self.raw.recv().await {
            Some(frame) => self.opening.open_text(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Next well-formed envelope.
    ///
    /// Malformed envelopes are logged and skipped; crypto failures end the
    /// stream with an error.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        while let Some(plaintext) = self.recv().await? {
            match Envelope::from_json(&plaintext) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed envelope");
                }
            }
        }
        Ok(None)
    }
}
