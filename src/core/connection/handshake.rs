//! Offer/answer handshake and candidate sequencing for one peer session.
//!
//! ```text
//!            create_connection            answer applied
//!   Idle ───────────────► Offering ─► AwaitingAnswer ───────────► Connected
//!    │                                   │ decline / unreachable
//!    │ offer                             ▼
//!    └──────► OfferReceived ──accept──► Accepting ──────────────► Connected
//!                    │
//!                    └──decline──► Declining ──► Idle
//! ```
//!
//! Network candidates that arrive before the remote description is set are
//! parked in a bounded queue tagged with their source peer, then applied in
//! arrival order exactly once when the description lands. Later candidates
//! are applied immediately.
//!
//! A peer disconnect is not a state: [`Handshake::reset`] tears the session
//! down and lands on `Idle`.

use super::transport::{PeerTransport, Role, TransportEvent, TransportFactory};
use crate::core::config::{BUSY_REASON, MAX_PENDING_CANDIDATES};
use crate::core::error::ProtocolError;
use crate::core::signaling::client::SignalSink;
use crate::core::signaling::{IceCandidate, PeerId, SessionDescription, Signal, SignalData};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Offering,
    AwaitingAnswer,
    OfferReceived,
    Accepting,
    Declining,
    Connected,
}

/// An offer held until the local user accepts or declines it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOffer {
    pub from: PeerId,
    pub descriptor: SessionDescription,
}

/// What a processed signal means for the layer above.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
    OfferReceived { from: PeerId },
    AnswerApplied { from: PeerId },
    Declined { from: PeerId, reason: Option<String> },
    /// A second offer arrived while busy and was declined automatically.
    BusyRejected { from: PeerId },
}

/// Transport events tagged with the session generation that produced them.
pub type TaggedTransportEvent = (u64, TransportEvent);

/// Candidates waiting for a remote description.
#[derive(Debug)]
pub struct CandidateQueue {
    entries: VecDeque<(PeerId, IceCandidate)>,
    capacity: usize,
}

impl CandidateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, from: &str, candidate: IceCandidate) -> Result<(), ProtocolError> {
        if self.entries.len() >= self.capacity {
            return Err(ProtocolError::CandidateQueueFull(self.capacity));
        }
        self.entries.push_back((from.to_string(), candidate));
        Ok(())
    }

    /// Take every queued candidate from `peer` in arrival order and discard
    /// the rest.
    pub fn drain_for(&mut self, peer: &str) -> Vec<IceCandidate> {
        let mut kept = Vec::with_capacity(self.entries.len());
        for (from, candidate) in self.entries.drain(..) {
            if from == peer {
                kept.push(candidate);
            } else {
                debug!(event = "candidate_discarded", %from, expected = peer);
            }
        }
        kept
    }

    /// Forget queued candidates from anyone but `peer`, freeing room for
    /// the session peer's own.
    pub fn retain_for(&mut self, peer: &str) {
        let before = self.entries.len();
        self.entries.retain(|(from, _)| from == peer);
        let discarded = before - self.entries.len();
        if discarded > 0 {
            debug!(event = "candidates_discarded", peer, discarded);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct Handshake {
    local_id: PeerId,
    signaling: Arc<dyn SignalSink>,
    factory: Arc<dyn TransportFactory>,
    transport_events: mpsc::UnboundedSender<TaggedTransportEvent>,
    state: HandshakeState,
    remote: Option<PeerId>,
    transport: Option<Arc<dyn PeerTransport>>,
    pending_offer: Option<PendingOffer>,
    candidates: CandidateQueue,
    remote_description_set: bool,
    generation: u64,
}

impl Handshake {
    pub fn new(
        local_id: PeerId,
        signaling: Arc<dyn SignalSink>,
        factory: Arc<dyn TransportFactory>,
        transport_events: mpsc::UnboundedSender<TaggedTransportEvent>,
    ) -> Self {
        Self {
            local_id,
            signaling,
            factory,
            transport_events,
            state: HandshakeState::Idle,
            remote: None,
            transport: None,
            pending_offer: None,
            candidates: CandidateQueue::new(MAX_PENDING_CANDIDATES),
            remote_description_set: false,
            generation: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.clone()
    }

    #[cfg(test)]
    pub fn pending_offer(&self) -> Option<&PendingOffer> {
        self.pending_offer.as_ref()
    }

    #[cfg(test)]
    pub fn queued_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Whether an event tagged `generation` belongs to the live session.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    fn is_busy(&self) -> bool {
        self.state != HandshakeState::Idle || self.pending_offer.is_some()
    }

    /// Open a transport whose events are tagged with the current generation.
    async fn open_transport(&self, role: Role) -> Result<Arc<dyn PeerTransport>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = self.transport_events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if out.send((generation, event)).is_err() {
                    break;
                }
            }
        });
        self.factory.open(role, tx).await
    }

    // ── Offerer side ─────────────────────────────────────────────────────────

    /// Start a session with `target`: open a transport, create and apply the
    /// offer, and signal it.
    pub async fn create_connection(&mut self, target: &str) -> Result<()> {
        if self.is_busy() {
            warn!(event = "connect_refused", target, state = ?self.state, "Session already in progress");
            return Err(ProtocolError::Busy.into());
        }
        self.state = HandshakeState::Offering;
        self.remote = Some(target.to_string());
        self.candidates.retain_for(target);

        match self.send_offer(target).await {
            Ok(()) => {
                self.state = HandshakeState::AwaitingAnswer;
                info!(event = "offer_sent", from = %self.local_id, target, "Offer sent");
                Ok(())
            }
            Err(e) => {
                warn!(event = "offer_failed", target, error = %e);
                self.reset().await;
                Err(e)
            }
        }
    }

    async fn send_offer(&mut self, target: &str) -> Result<()> {
        let transport = self.open_transport(Role::Offerer).await?;
        self.transport = Some(transport.clone());
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.signaling.send(target, SignalData::offer(offer))?;
        Ok(())
    }

    async fn on_answer(&mut self, from: &str, desc: SessionDescription) -> Result<Option<HandshakeEvent>> {
        if self.state != HandshakeState::AwaitingAnswer || self.remote.as_deref() != Some(from) {
            warn!(event = "answer_ignored", from, state = ?self.state, "Unexpected answer");
            return Ok(None);
        }
        let transport = self.transport.clone().ok_or(ProtocolError::NotConnected)?;
        transport.set_remote_description(desc).await?;
        self.remote_description_set = true;
        self.drain_candidates(transport.as_ref(), from).await;
        self.state = HandshakeState::Connected;
        info!(event = "answer_applied", from, "Peer accepted; answer applied");
        Ok(Some(HandshakeEvent::AnswerApplied {
            from: from.to_string(),
        }))
    }

    /// Our offer was declined. Only meaningful while awaiting that peer's answer.
    pub async fn declined(&mut self, from: &str, reason: Option<String>) -> Option<HandshakeEvent> {
        if self.state != HandshakeState::AwaitingAnswer || self.remote.as_deref() != Some(from) {
            debug!(event = "decline_ignored", from, state = ?self.state);
            return None;
        }
        info!(event = "offer_declined", from, reason = reason.as_deref().unwrap_or(""), "Peer declined");
        self.reset().await;
        Some(HandshakeEvent::Declined {
            from: from.to_string(),
            reason,
        })
    }

    /// The relay could not reach `target`. Abandons an offer that never left.
    pub async fn peer_unreachable(&mut self, target: &str) -> bool {
        if self.state == HandshakeState::AwaitingAnswer && self.remote.as_deref() == Some(target) {
            self.reset().await;
            return true;
        }
        false
    }

    // ── Answerer side ────────────────────────────────────────────────────────

    async fn on_offer(&mut self, from: &str, desc: SessionDescription) -> Result<Option<HandshakeEvent>> {
        if self.is_busy() {
            warn!(event = "offer_rejected_busy", from, state = ?self.state, "Declining offer while busy");
            if let Err(e) = self
                .signaling
                .send(from, SignalData::decline(Some(BUSY_REASON.to_string())))
            {
                warn!(event = "busy_decline_failed", from, error = %e);
            }
            return Ok(Some(HandshakeEvent::BusyRejected {
                from: from.to_string(),
            }));
        }

        let transport = self.open_transport(Role::Answerer).await?;
        self.transport = Some(transport);
        self.remote = Some(from.to_string());
        self.candidates.retain_for(from);
        self.pending_offer = Some(PendingOffer {
            from: from.to_string(),
            descriptor: desc,
        });
        self.state = HandshakeState::OfferReceived;
        info!(event = "offer_received", from, "Incoming connection offer");
        Ok(Some(HandshakeEvent::OfferReceived {
            from: from.to_string(),
        }))
    }

    fn take_matching_offer(&mut self, from: &str) -> Option<PendingOffer> {
        if self.state != HandshakeState::OfferReceived {
            return None;
        }
        match &self.pending_offer {
            Some(offer) if offer.from == from => self.pending_offer.take(),
            _ => None,
        }
    }

    /// Accept the pending offer from `from`. `Ok(false)` when there is no
    /// matching offer; nothing changes in that case.
    pub async fn accept_offer(&mut self, from: &str) -> Result<bool> {
        let Some(offer) = self.take_matching_offer(from) else {
            warn!(event = "accept_ignored", from, state = ?self.state, "No matching pending offer");
            return Ok(false);
        };
        self.state = HandshakeState::Accepting;

        match self.send_answer(&offer).await {
            Ok(()) => {
                self.state = HandshakeState::Connected;
                info!(event = "offer_accepted", from, "Answer sent");
                Ok(true)
            }
            Err(e) => {
                warn!(event = "accept_failed", from, error = %e);
                self.reset().await;
                Err(e)
            }
        }
    }

    async fn send_answer(&mut self, offer: &PendingOffer) -> Result<()> {
        let transport = self.transport.clone().ok_or(ProtocolError::NotConnected)?;
        transport
            .set_remote_description(offer.descriptor.clone())
            .await?;
        self.remote_description_set = true;
        self.drain_candidates(transport.as_ref(), &offer.from).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.signaling.send(&offer.from, SignalData::answer(answer))?;
        Ok(())
    }

    /// Decline the pending offer from `from` and return to `Idle`.
    pub async fn decline_offer(&mut self, from: &str) -> Result<bool> {
        if self.take_matching_offer(from).is_none() {
            warn!(event = "decline_ignored", from, state = ?self.state, "No matching pending offer");
            return Ok(false);
        }
        self.state = HandshakeState::Declining;
        let sent = self.signaling.send(from, SignalData::decline(None));
        self.reset().await;
        info!(event = "offer_declined_locally", from);
        sent?;
        Ok(true)
    }

    // ── Candidates ───────────────────────────────────────────────────────────

    async fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidate) -> Result<()> {
        if let Some(remote) = &self.remote {
            if remote != from {
                warn!(event = "candidate_ignored", from, %remote, "Candidate from a peer outside the session");
                return Ok(());
            }
        }

        match (&self.transport, self.remote_description_set) {
            (Some(transport), true) => {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!(event = "candidate_rejected", from, error = %e);
                }
                Ok(())
            }
            _ => {
                self.candidates.push(from, candidate).map_err(|e| {
                    warn!(event = "candidate_dropped", from, error = %e, "Candidate queue full");
                    e
                })?;
                debug!(event = "candidate_queued", from, queued = self.candidates.len());
                Ok(())
            }
        }
    }

    async fn drain_candidates(&mut self, transport: &dyn PeerTransport, peer: &str) {
        let queued = self.candidates.drain_for(peer);
        if !queued.is_empty() {
            debug!(event = "candidates_drained", peer, count = queued.len());
        }
        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!(event = "candidate_rejected", peer, error = %e);
            }
        }
    }

    /// Forward a locally gathered candidate to the session peer.
    pub fn send_local_candidate(&self, candidate: IceCandidate) {
        let Some(remote) = &self.remote else {
            debug!(event = "local_candidate_unrouted", "No remote peer for local candidate");
            return;
        };
        if let Err(e) = self.signaling.send(remote, SignalData::candidate(candidate)) {
            warn!(event = "local_candidate_failed", %remote, error = %e);
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Process one inbound signal from `from`.
    pub async fn handle_signal(&mut self, from: &str, data: SignalData) -> Result<Option<HandshakeEvent>> {
        match data.classify() {
            Signal::Offer(desc) => self.on_offer(from, desc).await,
            Signal::Answer(desc) => self.on_answer(from, desc).await,
            Signal::Candidate(candidate) => {
                self.on_remote_candidate(from, candidate).await?;
                Ok(None)
            }
            Signal::Decline { reason } => Ok(self.declined(from, reason).await),
            Signal::Unknown => {
                warn!(event = "signal_unknown", from, "Ignoring unrecognized signal payload");
                Ok(None)
            }
        }
    }

    /// Drop every piece of session state and return to `Idle`. Events from
    /// the closed transport are ignored from here on. Returns whether there
    /// was anything to tear down.
    pub async fn reset(&mut self) -> bool {
        let had_session = self.is_busy() || self.transport.is_some() || !self.candidates.is_empty();
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(event = "transport_close_failed", error = %e);
            }
        }
        self.pending_offer = None;
        self.candidates.clear();
        self.remote = None;
        self.remote_description_set = false;
        self.state = HandshakeState::Idle;
        self.generation += 1;
        had_session
    }
}
