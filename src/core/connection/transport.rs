//! Transport seam between the handshake/session logic and the connectivity
//! stack underneath it.
//!
//! A [`PeerTransport`] owns one peer connection plus its single ordered,
//! reliable message channel. Everything asynchronous the transport observes
//! (gathered candidates, channel open/close, inbound messages) is pushed as a
//! [`TransportEvent`] onto the sender handed to [`TransportFactory::open`], so
//! the session engine sees it in order with its other inputs.

use crate::core::signaling::{IceCandidate, SessionDescription};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of the handshake a transport is opened for. The offerer
/// creates the channel; the answerer receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// One data-channel message. Text carries control JSON and the end marker;
/// binary carries ciphertext chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A locally gathered candidate that should be signaled to the peer.
    LocalCandidate(IceCandidate),
    ChannelOpen,
    Message(ChannelMessage),
    ChannelClosed,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Send one message in order. Fails with
    /// [`ProtocolError::ChannelClosed`](crate::core::error::ProtocolError::ChannelClosed)
    /// when the channel is not open.
    async fn send(&self, message: ChannelMessage) -> Result<()>;

    fn is_channel_open(&self) -> bool;

    /// Flush what can be flushed within a bounded wait, then tear down.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
