//! Data-channel application protocol.
//!
//! Text messages carry JSON control objects tagged by `type` (or the bare
//! end-of-transfer marker); binary messages carry ciphertext chunks.
//!
//! ```text
//! { "type": "publicKey",  "key": [..32 bytes..] }
//! { "type": "metadata",   "name", "fileType", "size", "keyIV",
//!                         "encryptedAESKey", "fileIV", "hash" }
//! <binary chunk> * N
//! "__END__"
//! { "type": "disconnect" }
//! ```
//!
//! Byte fields are JSON arrays of numbers, as browsers produce from
//! `Array.from(Uint8Array)`.

pub mod receiver;
pub mod sender;

use crate::core::config::{MAX_FILE_SIZE, PROGRESS_CEILING};
use crate::core::connection::crypto::{IV_SIZE, KEY_SIZE, TAG_SIZE};
use crate::core::connection::transport::ChannelMessage;
use crate::core::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Text message closing the chunk stream of one file.
pub const END_OF_TRANSFER: &str = "__END__";

/// Describes the file that follows and how to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(rename = "fileType")]
    pub file_type: String,
    /// Plaintext size in bytes.
    pub size: u64,
    #[serde(rename = "keyIV")]
    pub key_iv: Vec<u8>,
    #[serde(rename = "encryptedAESKey")]
    pub encrypted_key: Vec<u8>,
    #[serde(rename = "fileIV")]
    pub file_iv: Vec<u8>,
    /// Lowercase hex SHA-256 of the plaintext.
    pub hash: String,
}

impl FileMetadata {
    /// Reject metadata whose crypto fields cannot be valid before any chunk
    /// is buffered for it.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.size > MAX_FILE_SIZE {
            return Err(ProtocolError::FileTooLarge {
                size: self.size,
                max: MAX_FILE_SIZE,
            });
        }
        if self.key_iv.len() != IV_SIZE || self.file_iv.len() != IV_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "IVs must be {IV_SIZE} bytes (keyIV {}, fileIV {})",
                self.key_iv.len(),
                self.file_iv.len()
            )));
        }
        if self.encrypted_key.len() != KEY_SIZE + TAG_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "wrapped key must be {} bytes, got {}",
                KEY_SIZE + TAG_SIZE,
                self.encrypted_key.len()
            )));
        }
        if self.hash.len() != 64 || !self.hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::Malformed("hash must be 64 hex characters".into()));
        }
        Ok(())
    }

    /// Expected ciphertext length: plaintext plus the GCM tag. `None` if the
    /// declared size cannot be represented.
    pub fn ciphertext_len(&self) -> Option<u64> {
        self.size.checked_add(TAG_SIZE as u64)
    }
}

/// JSON control messages exchanged over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AppMessage {
    PublicKey { key: Vec<u8> },
    Metadata(FileMetadata),
    Disconnect,
}

impl AppMessage {
    pub fn to_channel_message(&self) -> Result<ChannelMessage, ProtocolError> {
        serde_json::to_string(self)
            .map(ChannelMessage::Text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// One inbound data-channel message, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    App(AppMessage),
    Chunk(Vec<u8>),
    End,
}

pub fn parse_inbound(message: ChannelMessage) -> Result<Inbound, ProtocolError> {
    match message {
        ChannelMessage::Binary(bytes) => Ok(Inbound::Chunk(bytes)),
        ChannelMessage::Text(text) if text == END_OF_TRANSFER => Ok(Inbound::End),
        ChannelMessage::Text(text) => serde_json::from_str(&text)
            .map(Inbound::App)
            .map_err(|e| ProtocolError::Malformed(e.to_string())),
    }
}

/// Transfer progress in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    pub total: u64,
    pub finished: bool,
}

impl Progress {
    /// Percentage for display. Stays at or below the ceiling until the end
    /// marker has been handled, whatever the byte counts say.
    pub fn percent(&self) -> f64 {
        if self.finished {
            return 100.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        (self.transferred as f64 / self.total as f64 * 100.0).min(PROGRESS_CEILING)
    }
}
