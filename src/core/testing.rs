//! In-process doubles for the handshake and session tests.
//!
//! - [`MockFactory`] records every transport call so handshake ordering can
//!   be asserted without a network.
//! - [`LoopbackNetwork`] pairs two transports back to back: the channel
//!   opens once both sides have local and remote descriptions, and sends are
//!   delivered to the other side's event stream.
//! - [`relay_peer`] wires a real [`SignalingClient`] into a real [`Relay`]
//!   through channels instead of sockets.

use crate::core::connection::transport::{
    ChannelMessage, PeerTransport, Role, TransportEvent, TransportFactory,
};
use crate::core::error::ProtocolError;
use crate::core::relay::{PeerLink, Relay, RelayConnection};
use crate::core::signaling::client::{envelope_events, SignalEvent, SignalSink, SignalingClient};
use crate::core::signaling::{ClientEnvelope, IceCandidate, SdpKind, SessionDescription, SignalData};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

// ── Recording doubles ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(Role),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Send(ChannelMessage),
    Close,
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }
}

pub struct MockTransport {
    log: CallLog,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    /// Inject an event as if the stack had produced it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.log.push(Call::CreateOffer);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "mock-offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.log.push(Call::CreateAnswer);
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "mock-answer".into(),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.push(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.log.push(Call::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.log.push(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        self.log.push(Call::Send(message));
        Ok(())
    }

    fn is_channel_open(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.log.push(Call::Close);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub log: CallLog,
    transports: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl MockFactory {
    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().unwrap().last().cloned()
    }

    pub fn opened(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        self.log.push(Call::Open(role));
        let transport = Arc::new(MockTransport {
            log: self.log.clone(),
            events,
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Captures outbound signals instead of sending them.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, SignalData)>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<(String, SignalData)> {
        self.sent.lock().unwrap().clone()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, target: &str, data: SignalData) -> Result<(), ProtocolError> {
        self.sent.lock().unwrap().push((target.to_string(), data));
        Ok(())
    }
}

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

// ── Loopback transport ───────────────────────────────────────────────────────

#[derive(Default)]
struct Side {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    local_set: bool,
    remote_set: bool,
    closed: bool,
}

#[derive(Default)]
struct Link {
    sides: Vec<Side>,
    open: bool,
}

impl Link {
    fn other(&self, index: usize) -> Option<&Side> {
        self.sides.get(1 - index)
    }

    fn maybe_open(&mut self) {
        if self.open || self.sides.len() != 2 {
            return;
        }
        if self.sides.iter().all(|s| s.local_set && s.remote_set) {
            self.open = true;
            for side in &self.sides {
                if let Some(tx) = &side.events {
                    let _ = tx.send(TransportEvent::ChannelOpen);
                }
            }
        }
    }
}

/// Two transports joined back to back. The first opened is side 0.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    link: Arc<Mutex<Link>>,
    transports: Arc<Mutex<Vec<Arc<LoopbackTransport>>>>,
}

impl LoopbackNetwork {
    pub fn transport(&self, index: usize) -> Option<Arc<LoopbackTransport>> {
        self.transports.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn open(
        &self,
        _role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let index = {
            let mut link = self.link.lock().unwrap();
            anyhow::ensure!(link.sides.len() < 2, "loopback network already has two sides");
            link.sides.push(Side {
                events: Some(events),
                ..Default::default()
            });
            link.sides.len() - 1
        };
        let transport = Arc::new(LoopbackTransport {
            index,
            link: self.link.clone(),
            applied: Mutex::new(Vec::new()),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub struct LoopbackTransport {
    index: usize,
    link: Arc<Mutex<Link>>,
    applied: Mutex<Vec<IceCandidate>>,
}

impl LoopbackTransport {
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("loopback-offer-{}", self.index),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("loopback-answer-{}", self.index),
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        let mut link = self.link.lock().unwrap();
        let side = &mut link.sides[self.index];
        side.local_set = true;
        // One host candidate per side, gathered once the local description is set.
        if let Some(tx) = &side.events {
            let _ = tx.send(TransportEvent::LocalCandidate(candidate(&format!(
                "candidate:loopback-{}",
                self.index
            ))));
        }
        link.maybe_open();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        let mut link = self.link.lock().unwrap();
        link.sides[self.index].remote_set = true;
        link.maybe_open();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        let link = self.link.lock().unwrap();
        let me = &link.sides[self.index];
        let other = link.other(self.index);
        match other.and_then(|o| o.events.as_ref()) {
            Some(tx) if link.open && !me.closed && !other.is_some_and(|o| o.closed) => {
                let _ = tx.send(TransportEvent::Message(message));
                Ok(())
            }
            _ => Err(ProtocolError::ChannelClosed.into()),
        }
    }

    fn is_channel_open(&self) -> bool {
        let link = self.link.lock().unwrap();
        link.open && !link.sides[self.index].closed
    }

    async fn close(&self) -> Result<()> {
        let mut link = self.link.lock().unwrap();
        if link.sides[self.index].closed {
            return Ok(());
        }
        link.sides[self.index].closed = true;
        // A channel that never opened never reports a close.
        if !link.open {
            return Ok(());
        }
        if let Some(other) = link.other(self.index) {
            if !other.closed {
                if let Some(tx) = &other.events {
                    let _ = tx.send(TransportEvent::ChannelClosed);
                }
            }
        }
        Ok(())
    }
}

// ── Relay without sockets ────────────────────────────────────────────────────

/// Register `peer_id` with `relay` and return a real client plus its event
/// stream, with channels standing in for the WebSocket.
pub async fn relay_peer(
    relay: Arc<Relay>,
    peer_id: &str,
) -> (Arc<SignalingClient>, mpsc::UnboundedReceiver<SignalEvent>) {
    let (env_tx, mut env_rx) = mpsc::unbounded_channel();
    let mut connection = RelayConnection::new(relay, PeerLink::new(env_tx));
    let register = serde_json::to_string(&ClientEnvelope::Register {
        peer_id: peer_id.to_string(),
    })
    .unwrap();
    connection.handle_text(&register).await;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match msg {
                Message::Text(text) => connection.handle_text(&text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
        connection.close().await;
    });

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(envelope) = env_rx.recv().await {
            for event in envelope_events(envelope) {
                let _ = event_tx.send(event);
            }
        }
    });

    let client = SignalingClient::from_parts(
        peer_id.to_string(),
        out_tx,
        Arc::new(AtomicBool::new(true)),
    );
    (Arc::new(client), event_rx)
}
