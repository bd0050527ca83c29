//! Signaling relay: a peer directory plus envelope routing.
//!
//! The relay never inspects session descriptors, candidates or keys. It
//! reads the envelope `type`, the registration id, the signal `target` and
//! `data.type` (to route answers and declines), nothing else.

pub mod server;

use crate::core::signaling::{ClientEnvelope, EnvelopeKind, PeerId, ServerEnvelope};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound half of one relay connection.
#[derive(Debug, Clone)]
pub struct PeerLink {
    connection_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEnvelope>,
}

impl PeerLink {
    pub fn new(tx: mpsc::UnboundedSender<ServerEnvelope>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            tx,
        }
    }

    #[cfg(test)]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Queue an envelope for this connection. `false` once the socket is gone.
    pub fn deliver(&self, envelope: ServerEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    PeerNotFound,
}

/// Live peer directory. Last registration for an id wins.
#[derive(Debug, Default)]
pub struct Relay {
    peers: RwLock<HashMap<PeerId, PeerLink>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `peer_id` to `link`, returning the connection it replaced.
    pub async fn register(&self, peer_id: &str, link: PeerLink) -> Option<PeerLink> {
        let replaced = self.peers.write().await.insert(peer_id.to_string(), link);
        if let Some(old) = &replaced {
            info!(
                event = "peer_reregistered",
                peer_id,
                replaced = %old.connection_id,
                "Peer re-registered; previous connection superseded"
            );
        } else {
            info!(event = "peer_registered", peer_id, "Peer registered");
        }
        replaced
    }

    /// Remove `peer_id` only if it still maps to `connection_id`, so a stale
    /// socket closing never evicts a newer registration.
    pub async fn unregister(&self, peer_id: &str, connection_id: Uuid) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(link) if link.connection_id == connection_id => {
                peers.remove(peer_id);
                info!(event = "peer_unregistered", peer_id, "Peer disconnected");
                true
            }
            Some(_) => {
                debug!(event = "unregister_skipped", peer_id, "Peer id owned by a newer connection");
                false
            }
            None => false,
        }
    }

    /// Route `data` from `from` to `target`. Unknown targets get an error
    /// envelope on `reply`.
    pub async fn forward(
        &self,
        from: &str,
        reply: &PeerLink,
        target: &str,
        data: Value,
    ) -> ForwardOutcome {
        let kind = forwarded_kind(&data);
        let delivered = {
            let peers = self.peers.read().await;
            peers
                .get(target)
                .is_some_and(|link| link.deliver(ServerEnvelope::forwarded(kind, from, data)))
        };

        if delivered {
            debug!(event = "signal_forwarded", from, target, ?kind);
            ForwardOutcome::Delivered
        } else {
            warn!(event = "peer_not_found", from, target, "Signal target not registered");
            reply.deliver(ServerEnvelope::error(
                format!("Peer ID {target} not found."),
                Some(target),
            ));
            ForwardOutcome::PeerNotFound
        }
    }

    #[cfg(test)]
    pub async fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

/// `data.type == "answer"` is an acceptance, `"decline"` a refusal, anything
/// else a plain signal.
fn forwarded_kind(data: &Value) -> EnvelopeKind {
    match data.get("type").and_then(Value::as_str) {
        Some("answer") => EnvelopeKind::Answer,
        Some("decline") => EnvelopeKind::Decline,
        _ => EnvelopeKind::Signal,
    }
}

/// Per-socket relay state, independent of the WebSocket implementation.
pub struct RelayConnection {
    relay: Arc<Relay>,
    link: PeerLink,
    peer_id: Option<PeerId>,
}

impl RelayConnection {
    pub fn new(relay: Arc<Relay>, link: PeerLink) -> Self {
        Self {
            relay,
            link,
            peer_id: None,
        }
    }

    #[cfg(test)]
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event = "relay_frame_invalid", %e, "Ignoring malformed client message");
                return;
            }
        };

        match envelope {
            ClientEnvelope::Register { peer_id } => {
                if let Some(previous) = self.peer_id.take() {
                    if previous != peer_id {
                        self.relay
                            .unregister(&previous, self.link.connection_id)
                            .await;
                    }
                }
                self.relay.register(&peer_id, self.link.clone()).await;
                self.peer_id = Some(peer_id);
            }
            ClientEnvelope::Signal { target, data } => match &self.peer_id {
                Some(from) => {
                    self.relay.forward(from, &self.link, &target, data).await;
                }
                None => {
                    warn!(event = "signal_before_register", %target, "Signal from unregistered connection");
                    self.link.deliver(ServerEnvelope::error(
                        "Register before signaling.",
                        Some(&target),
                    ));
                }
            },
        }
    }

    /// Release the registration if this connection still owns it.
    pub async fn close(self) {
        if let Some(peer_id) = &self.peer_id {
            self.relay
                .unregister(peer_id, self.link.connection_id)
                .await;
        }
    }
}
