//! Signaling wire format shared by the relay and its clients.
//!
//! Envelopes are JSON objects tagged by `type`. The relay only reads the
//! routing fields (`type`, `peerId`, `target`) and the inner `data.type`;
//! everything inside `data` is opaque to it and forwarded verbatim.
//!
//! ```text
//! client -> relay   { "type": "register", "peerId": "k3v9x0aa" }
//! client -> relay   { "type": "signal", "target": "q81mzz0p", "data": {..} }
//! relay  -> client  { "type": "signal"|"answer"|"decline"|"error",
//!                     "from": "..", "data": {..}, "message": ".." }
//! ```

pub mod client;

use crate::core::config::PEER_ID_LEN;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque rendezvous token. Never an authenticated identity.
pub type PeerId = String;

/// Generate a fresh lowercase base-36 peer identifier.
pub fn generate_peer_id() -> PeerId {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..PEER_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// Client → relay messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEnvelope {
    Register {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    Signal {
        target: PeerId,
        data: serde_json::Value,
    },
}

/// Envelope kinds the relay emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Signal,
    Answer,
    Decline,
    Error,
}

/// Relay → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    /// Set on `error` envelopes: the peer that could not be reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerEnvelope {
    pub fn forwarded(kind: EnvelopeKind, from: &str, data: serde_json::Value) -> Self {
        Self {
            kind,
            from: Some(from.to_string()),
            target: None,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>, target: Option<&str>) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            from: None,
            target: target.map(str::to_string),
            data: None,
            message: Some(message.into()),
        }
    }
}

// ── Session descriptors and candidates ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One side's proposed connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One discovered reachability path, in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

// ── Signal payload ────────────────────────────────────────────────────────────

const KIND_ANSWER: &str = "answer";
const KIND_DECLINE: &str = "decline";

/// The opaque `data` member of a signal envelope.
///
/// Offers carry only `sdp`; answers also set `type: "answer"` so the relay can
/// route them as acceptance; declines carry `type: "decline"` and an optional
/// reason; candidates carry `candidate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A [`SignalData`] interpreted by what it asks the handshake to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Decline { reason: Option<String> },
    Unknown,
}

impl SignalData {
    pub fn offer(desc: SessionDescription) -> Self {
        Self {
            sdp: Some(desc),
            ..Default::default()
        }
    }

    pub fn answer(desc: SessionDescription) -> Self {
        Self {
            kind: Some(KIND_ANSWER.to_string()),
            sdp: Some(desc),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Default::default()
        }
    }

    pub fn decline(reason: Option<String>) -> Self {
        Self {
            kind: Some(KIND_DECLINE.to_string()),
            reason,
            ..Default::default()
        }
    }

    pub fn classify(self) -> Signal {
        if self.kind.as_deref() == Some(KIND_DECLINE) {
            return Signal::Decline {
                reason: self.reason,
            };
        }
        match (self.sdp, self.candidate) {
            (Some(desc), _) if desc.kind == SdpKind::Offer => Signal::Offer(desc),
            (Some(desc), _) => Signal::Answer(desc),
            (None, Some(candidate)) => Signal::Candidate(candidate),
            (None, None) => Signal::Unknown,
        }
    }
}
