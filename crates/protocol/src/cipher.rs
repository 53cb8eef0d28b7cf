//! Session cipher for the relay signaling channel.
//!
//! Every application frame is sealed with ChaCha20-Poly1305 under a
//! per-direction key. The nonce is four zero bytes followed by a 64-bit
//! big-endian message counter, and the counter is transmitted in front of
//! the ciphertext so the receiver can enforce strictly increasing sequence
//! numbers.
//!
//! ## Frame layout
//! ```text
//! ┌──────────────┬──────────────────────┬───────────────┐
//! │ sequence (8) │ ciphertext (N)       │ tag (16)      │
//! │ big-endian   │                      │ Poly1305      │
//! └──────────────┴──────────────────────┴───────────────┘
//! ```
//! On the wire the frame is base64 encoded (standard alphabet, padded).

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::ZeroizeOnDrop;

use crate::error::{ProtocolError, Result};

/// Length of a symmetric key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the transmitted sequence number.
pub const SEQUENCE_LEN: usize = 8;

/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Bytes added to every plaintext by [`SealingKey::seal`].
pub const FRAME_OVERHEAD: usize = SEQUENCE_LEN + TAG_LEN;

const NONCE_LEN: usize = 12;

fn nonce_for(sequence: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[NONCE_LEN - SEQUENCE_LEN..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Sending half of a session: seals outbound frames.
pub struct SealingKey {
    aead: ChaCha20Poly1305,
    next_sequence: u64,
}

impl SealingKey {
    /// Create a sealing key starting at sequence zero.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            next_sequence: 0,
        }
    }

    /// Sequence number the next sealed frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Seal a plaintext into a binary frame.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence
            .checked_add(1)
            .ok_or(ProtocolError::NonceExhausted)?;

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce_for(sequence)), plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

        let mut frame = Vec::with_capacity(SEQUENCE_LEN + ciphertext.len());
        frame.extend_from_slice(&sequence.to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Seal a text message and base64 encode the frame.
    pub fn seal_text(&mut self, plaintext: &str) -> Result<String> {
        Ok(BASE64.encode(self.seal(plaintext.as_bytes())?))
    }
}

// The AEAD wipes its key on drop
impl ZeroizeOnDrop for SealingKey {}

impl fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealingKey")
            .field("key", &"[REDACTED]")
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

/// Receiving half of a session: opens inbound frames.
pub struct OpeningKey {
    aead: ChaCha20Poly1305,
    last_sequence: Option<u64>,
}

impl OpeningKey {
    /// Create an opening key that has not accepted any frame yet.
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            last_sequence: None,
        }
    }

    /// Sequence number of the last accepted frame.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Open a binary frame.
    ///
    /// Fails closed on truncation, a bad tag, or a sequence number that does
    /// not exceed the last accepted one. State only advances on success.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::Decryption(format!(
                "frame of {} bytes is shorter than the {FRAME_OVERHEAD} byte overhead",
                frame.len()
            )));
        }

        let (header, ciphertext) = frame.split_at(SEQUENCE_LEN);
        let mut sequence_bytes = [0u8; SEQUENCE_LEN];
        sequence_bytes.copy_from_slice(header);
        let sequence = u64::from_be_bytes(sequence_bytes);

        if let Some(last) = self.last_sequence {
            if sequence <= last {
                return Err(ProtocolError::Replay {
                    last,
                    got: sequence,
                });
            }
        }

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(&nonce_for(sequence)), ciphertext)
            .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".to_string()))?;

        self.last_sequence = Some(sequence);
        Ok(plaintext)
    }

    /// Base64 decode and open a frame carrying UTF-8 text.
    pub fn open_text(&mut self, frame: &str) -> Result<String> {
        let bytes = BASE64.decode(frame.trim())?;
        let plaintext = self.open(&bytes)?;
        String::from_utf8(plaintext)
            .map_err(|e| ProtocolError::Decryption(format!("plaintext is not UTF-8: {e}")))
    }
}

impl ZeroizeOnDrop for OpeningKey {}

impl fmt::Debug for OpeningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpeningKey")
            .field("key", &"[REDACTED]")
            .field("last_sequence", &self.last_sequence)
            .finish()
    }
}

/// Both directions of an established session.
///
/// Produced by [`KeyExchange::finish`](crate::handshake::KeyExchange::finish).
/// Split it when sending and receiving happen on different tasks.
#[derive(Debug)]
pub struct SessionCipher {
    sealing: SealingKey,
    opening: OpeningKey,
}

impl SessionCipher {
    /// Build a cipher from the outbound and inbound keys.
    pub fn new(send_key: &[u8; KEY_LEN], receive_key: &[u8; KEY_LEN]) -> Self {
        Self {
            sealing: SealingKey::new(send_key),
            opening: OpeningKey::new(receive_key),
        }
    }

    /// Seal a text message for the wire.
    pub fn encrypt(&mut self, plaintext: &str) -> Result<String> {
        self.sealing.seal_text(plaintext)
    }

    /// Open a text message from the wire.
    pub fn decrypt(&mut self, frame: &str) -> Result<String> {
        self.opening.open_text(frame)
    }

    /// Separate the sending and receiving halves.
    pub fn split(self) -> (SealingKey, OpeningKey) {
        (self.sealing, self.opening)
    }
}
