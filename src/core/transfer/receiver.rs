//! Incoming file accumulation and verification.

use super::{FileMetadata, Progress};
use crate::core::config::MAX_FILE_SIZE;
use crate::core::connection::crypto::{open, unwrap_key, SharedSecret};
use crate::core::error::ProtocolError;
use crate::utils::hash::{digests_match, sha256_hex};
use std::fmt;
use tracing::{info, warn};

/// A decrypted file whose hash matched its metadata.
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for ReceivedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Ciphertext collected for one file, from metadata to end marker.
#[derive(Debug)]
pub struct TransferSession {
    metadata: FileMetadata,
    chunks: Vec<Vec<u8>>,
    received: u64,
    /// Ciphertext bytes the metadata announced.
    expected: u64,
}

impl TransferSession {
    pub fn start(metadata: FileMetadata) -> Result<Self, ProtocolError> {
        metadata.validate()?;
        let expected = metadata.ciphertext_len().ok_or(ProtocolError::FileTooLarge {
            size: metadata.size,
            max: MAX_FILE_SIZE,
        })?;
        info!(event = "receive_start", name = %metadata.name, size = metadata.size, "Receiving file");
        Ok(Self {
            metadata,
            chunks: Vec::new(),
            received: 0,
            expected,
        })
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    /// Append one ciphertext chunk in arrival order. A chunk that would run
    /// past the announced ciphertext length is refused and nothing is kept.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) -> Result<Progress, ProtocolError> {
        let received = self.received.saturating_add(chunk.len() as u64);
        if received > self.expected {
            warn!(
                event = "receive_overrun",
                name = %self.metadata.name,
                expected = self.expected,
                received
            );
            return Err(ProtocolError::Malformed(format!(
                "received {received} bytes for a {} byte ciphertext",
                self.expected
            )));
        }
        self.received = received;
        self.chunks.push(chunk);
        Ok(Progress {
            transferred: self.received.min(self.metadata.size),
            total: self.metadata.size,
            finished: false,
        })
    }

    /// Reassemble, unwrap the session key, decrypt and verify the hash.
    /// The plaintext is only returned if the digest matches.
    pub fn finish(self, secret: &SharedSecret) -> Result<ReceivedFile, ProtocolError> {
        let md = self.metadata;
        if self.received != self.expected {
            warn!(
                event = "receive_length_mismatch",
                name = %md.name,
                expected = self.expected,
                received = self.received
            );
        }
        let ciphertext = self.chunks.concat();

        let session_key = unwrap_key(secret, &md.key_iv, &md.encrypted_key)?;
        let plaintext = open(&session_key, &md.file_iv, &ciphertext)?;

        let actual = sha256_hex(&plaintext);
        if !digests_match(&actual, &md.hash) {
            warn!(event = "integrity_failure", name = %md.name, expected = %md.hash, %actual);
            return Err(ProtocolError::Integrity {
                expected: md.hash,
                actual,
            });
        }

        info!(event = "receive_complete", name = %md.name, bytes = plaintext.len(), "File verified");
        Ok(ReceivedFile {
            name: md.name,
            mime_type: md.file_type,
            data: plaintext,
        })
    }
}
