//! Centralized configuration constants for VoidShare.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (message tags, the end-of-transfer
//! sentinel, crypto sizes) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default ciphertext chunk size in bytes (64 KiB).
///
/// Every chunk travels as one binary data-channel message. 64 KiB matches the
/// default SCTP receive buffer of webrtc-rs and of browser stacks.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Smallest chunk size accepted from configuration.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest chunk size accepted from configuration. webrtc-rs refuses data
/// channel messages above its default SCTP max message size.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Largest plaintext a single transfer may carry (4 GiB). Files are held in
/// memory whole on both ends.
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Highest percentage reported while a transfer is still streaming.
/// 100% is reserved for a transfer that has passed its end-of-transfer marker.
pub const PROGRESS_CEILING: f64 = 99.0;

// ── Handshake ────────────────────────────────────────────────────────────────

/// Maximum network candidates buffered before the remote descriptor is set.
/// Overflow is treated as a sequencing error and the candidate is dropped.
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Decline reason sent when an offer arrives while a session is already live.
pub const BUSY_REASON: &str = "busy";

// ── Connection / Network ─────────────────────────────────────────────────────

/// Default relay WebSocket URL used by `send` and `receive`.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:4000";

/// Default relay listening port.
pub const DEFAULT_RELAY_PORT: u16 = 4000;

/// Default STUN server used when no ICE server is configured.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the single ordered data channel created by the offerer.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// High water mark for the data channel send buffer (bytes).
/// When `buffered_amount` exceeds this value the sender pauses until the
/// buffer drains.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

/// Poll interval while waiting for the send buffer to drain.
pub const DC_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest backpressure wait before a chunk is queued anyway.
pub const DC_BACKPRESSURE_MAX_WAIT: Duration = Duration::from_secs(10);

/// Upper bound on how long a closing transport waits for queued messages
/// (such as the disconnect notice) to leave the send buffer.
pub const DC_CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ── Peer identity ────────────────────────────────────────────────────────────

/// Length of a locally generated peer identifier.
pub const PEER_ID_LEN: usize = 8;

// ── Files ────────────────────────────────────────────────────────────────────

/// Default configuration file read at startup (CLI values take precedence).
pub const DEFAULT_CONFIG_FILE: &str = "voidshare.toml";

/// MIME type used when the sender does not provide one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
