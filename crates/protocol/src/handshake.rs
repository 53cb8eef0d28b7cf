//! Ephemeral X25519 key exchange for the relay signaling channel.
//!
//! Each side sends its base64 encoded public key as the first raw message,
//! reads exactly one public key back, and derives a [`SessionCipher`].
//!
//! ```text
//! -> base64(pk_local)
//! <- base64(pk_peer)
//! shared = X25519(sk_local, pk_peer)
//! okm    = HKDF-SHA256(ikm = shared, info = LABEL || min(pk) || max(pk))
//! key(min -> max) = okm[0..32], key(max -> min) = okm[32..64]
//! ```
//!
//! The exchange is symmetric: there is no initiator. Keys are ordered
//! bytewise so both sides agree which half of the output seals which
//! direction. Public keys are not authenticated, so this defeats a passive
//! eavesdropper on the relay but not an active one.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::cipher::{SessionCipher, KEY_LEN};
use crate::error::{ProtocolError, Result};

/// Length of an X25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// HKDF info prefix binding derived keys to this protocol.
const KDF_LABEL: &[u8] = b"nobody-chat/signaling/v1";

/// One side of an in-progress key exchange.
///
/// Consumed by [`KeyExchange::finish`]; the secret never leaves this type.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    /// Generate a fresh ephemeral keypair.
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Local public key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The first raw message to send: the public key in base64.
    pub fn public_key_message(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Complete the exchange with the peer's first raw message.
    pub fn finish(self, peer_message: &str) -> Result<SessionCipher> {
        let peer = decode_public_key(peer_message)?;

        if peer.as_bytes() == self.public.as_bytes() {
            return Err(ProtocolError::HandshakeFailed(
                "peer echoed our public key".to_string(),
            ));
        }

        let local = self.public;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(ProtocolError::HandshakeFailed(
                "peer public key has low order".to_string(),
            ));
        }

        let local_is_low = local.as_bytes() < peer.as_bytes();
        let (low, high) = if local_is_low {
            (local.as_bytes(), peer.as_bytes())
        } else {
            (peer.as_bytes(), local.as_bytes())
        };

        let mut info = Vec::with_capacity(KDF_LABEL.len() + 2 * PUBLIC_KEY_LEN);
        info.extend_from_slice(KDF_LABEL);
        info.extend_from_slice(low);
        info.extend_from_slice(high);

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
        hkdf.expand(&info, &mut okm[..])
            .map_err(|e| ProtocolError::HandshakeFailed(format!("key derivation failed: {e}")))?;

        let mut low_to_high = Zeroizing::new([0u8; KEY_LEN]);
        let mut high_to_low = Zeroizing::new([0u8; KEY_LEN]);
        low_to_high.copy_from_slice(&okm[..KEY_LEN]);
        high_to_low.copy_from_slice(&okm[KEY_LEN..]);

        let cipher = if local_is_low {
            SessionCipher::new(&low_to_high, &high_to_low)
        } else {
            SessionCipher::new(&high_to_low, &low_to_high)
        };
        Ok(cipher)
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &BASE64.encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Decode a base64 public key message.
pub fn decode_public_key(message: &str) -> Result<PublicKey> {
    let bytes = BASE64
        .decode(message.trim())
        .map_err(|e| ProtocolError::InvalidPublicKey(format!("invalid base64: {e}")))?;
    let bytes: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
        ProtocolError::InvalidPublicKey(format!(
            "expected {PUBLIC_KEY_LEN} bytes, got {}",
            b.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}
