//! Per-session key agreement and key wrapping.
//!
//! Each peer holds an ephemeral X25519 key pair. Public keys travel over the
//! data channel in clear; the 32-byte ECDH output is stretched with
//! HKDF-SHA256 into the AES-256-GCM key that wraps every per-file session key.
//!
//! ```text
//! Peer A                               Peer B
//! ──────                               ──────
//! channel open: pk_A ────────────────► on pk_A: derive, reply pk_B (if unsent)
//!               ◄──────────────────── pk_B
//! derive
//!
//! wrapping_key = HKDF-SHA256(ikm = X25519(sk_A, pk_B), info = "voidshare-key-wrap-v1")
//! ```
//!
//! The exchange is symmetric: whichever side sees the channel open first
//! sends first, and a peer never sends its key twice per session.

use crate::core::error::ProtocolError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const PUBLIC_KEY_SIZE: usize = 32;

const KEY_WRAP_INFO: &[u8] = b"voidshare-key-wrap-v1";

// ── X25519 ECDH ──────────────────────────────────────────────────────────────

/// An ephemeral X25519 key pair backed by `x25519-dalek`.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    pub public: [u8; PUBLIC_KEY_SIZE],
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        let secret = StaticSecret::from(bytes);
        let public = *X25519PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Raw ECDH. Low-order peer points (all-zero output) are rejected.
    pub fn diffie_hellman(&self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> Result<[u8; 32], ProtocolError> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidPublicKey);
        }
        Ok(*shared.as_bytes())
    }
}

/// The symmetric key both peers derive after the public-key exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; KEY_SIZE]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Derive the key-wrapping secret from our key pair and the peer's raw
/// public key.
pub fn derive_shared_secret(
    local: &EphemeralKeypair,
    remote_public: &[u8],
) -> Result<SharedSecret, ProtocolError> {
    let remote: [u8; PUBLIC_KEY_SIZE] = remote_public
        .try_into()
        .map_err(|_| ProtocolError::InvalidPublicKey)?;
    let ikm = local.diffie_hellman(&remote)?;

    let mut okm = [0u8; KEY_SIZE];
    Hkdf::<Sha256>::new(None, &ikm)
        .expand(KEY_WRAP_INFO, &mut okm)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
    Ok(SharedSecret(okm))
}

// ── AES-256-GCM ──────────────────────────────────────────────────────────────

pub fn generate_session_key() -> [u8; KEY_SIZE] {
    rand::random()
}

pub fn generate_iv() -> [u8; IV_SIZE] {
    rand::random()
}

fn cipher(key: &[u8; KEY_SIZE]) -> Result<Aes256Gcm, ProtocolError> {
    Aes256Gcm::new_from_slice(key).map_err(|e| ProtocolError::Encryption(e.to_string()))
}

/// Encrypt `plaintext` under `key`/`iv`. Output is ciphertext || 16-byte tag.
pub fn seal(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    cipher(key)?
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))
}

/// Decrypt and authenticate. Any tampering, wrong key or wrong IV fails.
pub fn open(key: &[u8; KEY_SIZE], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if iv.len() != IV_SIZE {
        return Err(ProtocolError::Decryption(format!(
            "expected {IV_SIZE}-byte IV, got {}",
            iv.len()
        )));
    }
    cipher(key)
        .map_err(|e| ProtocolError::Decryption(e.to_string()))?
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| ProtocolError::Decryption("authentication tag mismatch".into()))
}

/// A session key encrypted under the shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `session_key` under the shared secret with a fresh random IV.
pub fn wrap_key(secret: &SharedSecret, session_key: &[u8; KEY_SIZE]) -> Result<WrappedKey, ProtocolError> {
    let iv = generate_iv();
    let ciphertext = seal(secret.as_bytes(), &iv, session_key)?;
    Ok(WrappedKey { iv, ciphertext })
}

pub fn unwrap_key(secret: &SharedSecret, iv: &[u8], ciphertext: &[u8]) -> Result<[u8; KEY_SIZE], ProtocolError> {
    let raw = open(secret.as_bytes(), iv, ciphertext)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| ProtocolError::Decryption(format!("unwrapped key has {} bytes", raw.len())))
}

// ── Exchange state ───────────────────────────────────────────────────────────

/// Session-scoped key exchange state. The local key pair outlives sessions;
/// the remote key and derived secret do not.
pub struct KeyExchange {
    local: EphemeralKeypair,
    remote_public: Option<[u8; PUBLIC_KEY_SIZE]>,
    secret: Option<SharedSecret>,
    sent: bool,
}

impl KeyExchange {
    pub fn new(local: EphemeralKeypair) -> Self {
        Self {
            local,
            remote_public: None,
            secret: None,
            sent: false,
        }
    }

    #[cfg(test)]
    pub fn local_public(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.local.public
    }

    /// The key to announce when the channel opens, unless already sent.
    pub fn on_channel_open(&mut self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.take_unsent()
    }

    /// Import the peer's key and derive the secret. Returns our key if the
    /// peer spoke first and we still owe a reply.
    pub fn on_remote_key(&mut self, key: &[u8]) -> Result<Option<[u8; PUBLIC_KEY_SIZE]>, ProtocolError> {
        let secret = derive_shared_secret(&self.local, key)?;
        let mut remote = [0u8; PUBLIC_KEY_SIZE];
        remote.copy_from_slice(key);
        self.remote_public = Some(remote);
        self.secret = Some(secret);
        Ok(self.take_unsent())
    }

    fn take_unsent(&mut self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        if self.sent {
            return None;
        }
        self.sent = true;
        Some(self.local.public)
    }

    pub fn secret(&self) -> Option<&SharedSecret> {
        self.secret.as_ref()
    }

    #[cfg(test)]
    pub fn is_established(&self) -> bool {
        self.secret.is_some()
    }

    /// Forget everything learned from the current peer. Returns whether
    /// there was anything to forget.
    pub fn reset(&mut self) -> bool {
        let had_state = self.sent || self.remote_public.is_some();
        self.remote_public = None;
        self.secret = None;
        self.sent = false;
        had_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x25519_rfc7748_vector1() {
        // RFC 7748 §6.1, first test vector
        let scalar: [u8; 32] = [
            0xa5, 0x46, 0xe3, 0x6b, 0xf0, 0x52, 0x7c, 0x9d, 0x3b, 0x16, 0x15, 0x4b, 0x82,
            0x46, 0x5e, 0xdd, 0x62, 0x14, 0x4c, 0x0a, 0xc1, 0xfc, 0x5a, 0x18, 0x50, 0x6a,
            0x22, 0x44, 0xba, 0x44, 0x9a, 0xc4,
        ];
        let input_u: [u8; 32] = [
            0xe6, 0xdb, 0x68, 0x67, 0x58, 0x30, 0x30, 0xdb, 0x35, 0x94, 0xc1, 0xa4, 0x24,
            0xb1, 0x5f, 0x7c, 0x72, 0x66, 0x24, 0xec, 0x26, 0xb3, 0x35, 0x3b, 0x10, 0xa9,
            0x03, 0xa6, 0xd0, 0xab, 0x1c, 0x4c,
        ];
        let expected: [u8; 32] = [
            0xc3, 0xda, 0x55, 0x37, 0x9d, 0xe9, 0xc6, 0x90, 0x8e, 0x94, 0xea, 0x4d, 0xf2,
            0x8d, 0x08, 0x4f, 0x32, 0xec, 0xcf, 0x03, 0x49, 0x1c, 0x71, 0xf7, 0x54, 0xb4,
            0x07, 0x55, 0x77, 0xa2, 0x85, 0x52,
        ];
        let pair = EphemeralKeypair {
            secret: StaticSecret::from(scalar),
            public: [0u8; 32],
        };
        assert_eq!(pair.diffie_hellman(&input_u).unwrap(), expected);
    }

    #[test]
    fn test_x25519_rfc7748_vector2() {
        // RFC 7748 §6.1, second test vector
        let scalar: [u8; 32] = [
            0x4b, 0x66, 0xe9, 0xd4, 0xd1, 0xb4, 0x67, 0x3c, 0x5a, 0xd2, 0x26, 0x91, 0x95,
            0x7d, 0x6a, 0xf5, 0xc1, 0x1b, 0x64, 0x21, 0xe0, 0xea, 0x01, 0xd4, 0x2c, 0xa4,
            0x16, 0x9e, 0x79, 0x18, 0xba, 0x0d,
        ];
        let input_u: [u8; 32] = [
            0xe5, 0x21, 0x0f, 0x12, 0x78, 0x68, 0x11, 0xd3, 0xf4, 0xb7, 0x95, 0x9d, 0x05,
            0x38, 0xae, 0x2c, 0x31, 0xdb, 0xe7, 0x10, 0x6f, 0xc0, 0x3c, 0x3e, 0xfc, 0x4c,
            0xd5, 0x49, 0xc7, 0x15, 0xa4, 0x93,
        ];
        let expected: [u8; 32] = [
            0x95, 0xcb, 0xde, 0x94, 0x76, 0xe8, 0x90, 0x7d, 0x7a, 0xad, 0xe4, 0x5c, 0xb4,
            0xb8, 0x73, 0xf8, 0x8b, 0x59, 0x5a, 0x68, 0x79, 0x9f, 0xa1, 0x52, 0xe6, 0xf8,
            0xf7, 0x64, 0x7a, 0xac, 0x79, 0x57,
        ];
        let pair = EphemeralKeypair {
            secret: StaticSecret::from(scalar),
            public: [0u8; 32],
        };
        assert_eq!(pair.diffie_hellman(&input_u).unwrap(), expected);
    }

    #[test]
    fn low_order_point_is_rejected() {
        let pair = EphemeralKeypair::generate();
        assert_eq!(
            pair.diffie_hellman(&[0u8; 32]),
            Err(ProtocolError::InvalidPublicKey)
        );
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let a = derive_shared_secret(&alice, &bob.public).unwrap();
        let b = derive_shared_secret(&bob, &alice.public).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn short_public_key_is_rejected() {
        let alice = EphemeralKeypair::generate();
        assert_eq!(
            derive_shared_secret(&alice, &[1u8; 31]),
            Err(ProtocolError::InvalidPublicKey)
        );
    }

    #[test]
    fn wrapped_key_unwraps_with_same_secret_only() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let mallory = EphemeralKeypair::generate();
        let secret = derive_shared_secret(&alice, &bob.public).unwrap();
        let other = derive_shared_secret(&alice, &mallory.public).unwrap();

        let session_key = generate_session_key();
        let wrapped = wrap_key(&secret, &session_key).unwrap();
        assert_eq!(wrapped.ciphertext.len(), KEY_SIZE + TAG_SIZE);

        assert_eq!(
            unwrap_key(&secret, &wrapped.iv, &wrapped.ciphertext).unwrap(),
            session_key
        );
        assert!(matches!(
            unwrap_key(&other, &wrapped.iv, &wrapped.ciphertext),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn wrapping_twice_uses_fresh_ivs() {
        let alice = EphemeralKeypair::generate();
        let bob = EphemeralKeypair::generate();
        let secret = derive_shared_secret(&alice, &bob.public).unwrap();
        let key = generate_session_key();

        let first = wrap_key(&secret, &key).unwrap();
        let second = wrap_key(&secret, &key).unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn open_rejects_tampering_and_bad_iv_length() {
        let key = generate_session_key();
        let iv = generate_iv();
        let mut sealed = seal(&key, &iv, b"hello").unwrap();
        assert_eq!(open(&key, &iv, &sealed).unwrap(), b"hello");

        sealed[0] ^= 0x01;
        assert!(open(&key, &iv, &sealed).is_err());
        assert!(open(&key, &iv[..8], &sealed).is_err());
    }

    #[test]
    fn exchange_sends_once_regardless_of_who_speaks_first() {
        let mut a = KeyExchange::new(EphemeralKeypair::generate());
        let mut b = KeyExchange::new(EphemeralKeypair::generate());

        // A's channel opens first; B hears A before its own open event.
        let pk_a = a.on_channel_open().unwrap();
        let pk_b = b.on_remote_key(&pk_a).unwrap().expect("B replies");
        assert!(b.on_channel_open().is_none());
        assert!(a.on_remote_key(&pk_b).unwrap().is_none());

        assert_eq!(a.secret(), b.secret());
        assert!(a.is_established() && b.is_established());
    }

    #[test]
    fn reset_keeps_local_key_but_forgets_peer() {
        let mut a = KeyExchange::new(EphemeralKeypair::generate());
        let b = EphemeralKeypair::generate();
        let local = a.local_public();

        a.on_channel_open();
        a.on_remote_key(&b.public).unwrap();
        assert!(a.reset());
        assert!(!a.is_established());
        assert_eq!(a.local_public(), local);
        assert_eq!(a.on_channel_open(), Some(local));
        assert!(!KeyExchange::new(EphemeralKeypair::generate()).reset());
    }
}
