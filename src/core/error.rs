//! Protocol error taxonomy.
//!
//! Plumbing code returns `anyhow::Result`; the variants here are the ones the
//! consuming layer needs to tell apart (routing, sequencing, crypto,
//! integrity, channel state and wire format).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    // ── Routing ──────────────────────────────────────────────────────────────
    /// The relay does not know the target peer.
    #[error("peer {0} not found")]
    PeerNotFound(String),

    // ── Sequencing ───────────────────────────────────────────────────────────
    /// A session or pending offer already exists.
    #[error("a session is already in progress")]
    Busy,
    /// The candidate queue reached its bound before a remote descriptor arrived.
    #[error("candidate queue full ({0} entries)")]
    CandidateQueueFull(usize),
    /// The operation needs an established channel.
    #[error("no connected peer")]
    NotConnected,
    /// The operation needs the ECDH shared secret.
    #[error("key exchange has not completed")]
    KeyNotEstablished,

    // ── Crypto ───────────────────────────────────────────────────────────────
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("encryption failed: {0}")]
    Encryption(String),

    // ── Integrity ────────────────────────────────────────────────────────────
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    /// Declared or actual file size beyond what a transfer may carry.
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    // ── Channel ──────────────────────────────────────────────────────────────
    #[error("channel is not open")]
    ChannelClosed,

    // ── Wire ─────────────────────────────────────────────────────────────────
    #[error("malformed message: {0}")]
    Malformed(String),
}
