//! Outgoing file: hash, encrypt, wrap the key, then stream metadata,
//! ciphertext chunks and the end marker in order.

use super::{AppMessage, FileMetadata, Progress, END_OF_TRANSFER};
use crate::core::config::{DEFAULT_MIME_TYPE, MAX_FILE_SIZE};
use crate::core::connection::crypto::{generate_iv, generate_session_key, seal, wrap_key, SharedSecret};
use crate::core::connection::transport::{ChannelMessage, PeerTransport};
use crate::core::error::ProtocolError;
use crate::utils::hash::sha256_hex;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime_type: Option<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            data,
        }
    }

    pub async fn from_path(path: &Path, mime_type: Option<String>) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        Ok(Self::new(name, mime_type, data))
    }
}

/// A file encrypted and ready to stream.
#[derive(Debug, Clone)]
pub struct PreparedTransfer {
    pub metadata: FileMetadata,
    pub ciphertext: Vec<u8>,
}

/// Encrypt `file` under a fresh session key wrapped with `secret`.
/// CPU-bound: run it off the async executor for large files.
pub fn prepare(file: &OutgoingFile, secret: &SharedSecret) -> Result<PreparedTransfer, ProtocolError> {
    let size = file.data.len() as u64;
    if size > MAX_FILE_SIZE {
        return Err(ProtocolError::FileTooLarge {
            size,
            max: MAX_FILE_SIZE,
        });
    }
    let hash = sha256_hex(&file.data);
    let session_key = generate_session_key();
    let file_iv = generate_iv();
    let ciphertext = seal(&session_key, &file_iv, &file.data)?;
    let wrapped = wrap_key(secret, &session_key)?;

    Ok(PreparedTransfer {
        metadata: FileMetadata {
            name: file.name.clone(),
            file_type: file.mime_type.clone(),
            size,
            key_iv: wrapped.iv.to_vec(),
            encrypted_key: wrapped.ciphertext,
            file_iv: file_iv.to_vec(),
            hash,
        },
        ciphertext,
    })
}

/// Error returned when `stop` fires mid-stream.
#[derive(Debug, thiserror::Error)]
#[error("transfer cancelled")]
pub struct Cancelled;

/// Stream `prepared` over `transport`. Progress is reported after every
/// chunk and once more, finished, after the end marker.
pub async fn stream(
    transport: &dyn PeerTransport,
    prepared: &PreparedTransfer,
    chunk_size: usize,
    stop: &SignalOfStop,
    mut on_progress: impl FnMut(Progress),
) -> Result<()> {
    let chunk_size = chunk_size.max(1);
    let total = prepared.ciphertext.len() as u64;
    info!(
        event = "transfer_start",
        name = %prepared.metadata.name,
        size = prepared.metadata.size,
        chunks = prepared.ciphertext.len().div_ceil(chunk_size),
        "Sending file"
    );

    if stop.cancelled() {
        return Err(Cancelled.into());
    }
    transport
        .send(AppMessage::Metadata(prepared.metadata.clone()).to_channel_message()?)
        .await?;

    let mut sent = 0u64;
    for chunk in prepared.ciphertext.chunks(chunk_size) {
        if stop.cancelled() {
            debug!(event = "transfer_cancelled", sent, total);
            return Err(Cancelled.into());
        }
        transport.send(ChannelMessage::Binary(chunk.to_vec())).await?;
        sent += chunk.len() as u64;
        on_progress(Progress {
            transferred: sent,
            total,
            finished: false,
        });
    }

    if stop.cancelled() {
        return Err(Cancelled.into());
    }
    transport
        .send(ChannelMessage::Text(END_OF_TRANSFER.to_string()))
        .await?;
    on_progress(Progress {
        transferred: total,
        total,
        finished: true,
    });
    info!(event = "transfer_sent", name = %prepared.metadata.name, bytes = total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::crypto::{derive_shared_secret, EphemeralKeypair, TAG_SIZE};
    use crate::core::testing::{Call, MockFactory};
    use crate::core::connection::transport::{Role, TransportFactory};
    use tokio::sync::mpsc;

    fn secret() -> SharedSecret {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        derive_shared_secret(&a, &b.public).unwrap()
    }

    #[test]
    fn prepare_fills_metadata_and_encrypts() {
        let file = OutgoingFile::new("notes.txt", Some("text/plain".into()), b"hello".to_vec());
        let prepared = prepare(&file, &secret()).unwrap();

        assert_eq!(prepared.metadata.size, 5);
        assert_eq!(prepared.metadata.file_type, "text/plain");
        assert_eq!(prepared.metadata.hash, sha256_hex(b"hello"));
        assert_eq!(prepared.ciphertext.len(), 5 + TAG_SIZE);
        assert!(prepared.metadata.validate().is_ok());
        assert_ne!(&prepared.ciphertext[..5], b"hello");
    }

    #[test]
    fn mime_type_defaults_when_missing() {
        let file = OutgoingFile::new("blob", None, Vec::new());
        assert_eq!(file.mime_type, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn stream_sends_metadata_chunks_then_end_marker() {
        let factory = MockFactory::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.open(Role::Offerer, tx).await.unwrap();

        let file = OutgoingFile::new("data.bin", None, vec![7u8; 100]);
        let prepared = prepare(&file, &secret()).unwrap();
        let mut progress = Vec::new();
        stream(transport.as_ref(), &prepared, 40, &SignalOfStop::new(), |p| progress.push(p))
            .await
            .unwrap();

        let sends: Vec<ChannelMessage> = factory
            .log
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(m) => Some(m),
                _ => None,
            })
            .collect();
        // 116 ciphertext bytes in 40-byte chunks: metadata, 3 chunks, end marker.
        assert_eq!(sends.len(), 5);
        assert!(matches!(&sends[0], ChannelMessage::Text(t) if t.contains("\"metadata\"")));
        let chunk_lens: Vec<usize> = sends[1..4]
            .iter()
            .map(|m| match m {
                ChannelMessage::Binary(b) => b.len(),
                other => panic!("expected binary chunk, got {other:?}"),
            })
            .collect();
        assert_eq!(chunk_lens, vec![40, 40, 36]);
        assert_eq!(sends[4], ChannelMessage::Text(END_OF_TRANSFER.into()));

        assert_eq!(progress.len(), 4);
        assert!(progress[..3].iter().all(|p| !p.finished && p.percent() <= 99.0));
        assert!(progress[3].finished);
    }

    #[tokio::test]
    async fn stream_stops_when_cancelled() {
        let factory = MockFactory::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.open(Role::Offerer, tx).await.unwrap();
        let prepared = prepare(&OutgoingFile::new("x", None, vec![0; 10]), &secret()).unwrap();

        let stop = SignalOfStop::new();
        stop.cancel();
        let err = stream(transport.as_ref(), &prepared, 4, &stop, |_| {})
            .await
            .unwrap_err();
        assert!(err.is::<Cancelled>());
        // Cancelled before anything went out, metadata included.
        assert!(!factory.log.calls().iter().any(|c| matches!(c, Call::Send(_))));
    }

    #[tokio::test]
    async fn hundred_kib_in_32_kib_chunks_ends_with_partial_chunk() {
        let factory = MockFactory::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.open(Role::Offerer, tx).await.unwrap();
        let prepared = prepare(&OutgoingFile::new("doc.pdf", None, vec![3u8; 100 * 1024]), &secret()).unwrap();

        let mut progress = Vec::new();
        stream(transport.as_ref(), &prepared, 32 * 1024, &SignalOfStop::new(), |p| progress.push(p))
            .await
            .unwrap();

        let chunk_lens: Vec<usize> = factory
            .log
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(ChannelMessage::Binary(b)) => Some(b.len()),
                _ => None,
            })
            .collect();
        // 102 400 plaintext bytes plus the 16-byte tag.
        assert_eq!(chunk_lens, vec![32_768, 32_768, 32_768, 4_112]);
        assert_eq!(
            factory.log.calls().last(),
            Some(&Call::Send(ChannelMessage::Text(END_OF_TRANSFER.into())))
        );
        assert_eq!(progress.iter().filter(|p| p.finished).count(), 1);
        assert!(progress.last().unwrap().finished);
    }
}
