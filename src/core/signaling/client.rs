//! Signaling client: registers with the relay and exchanges envelopes.
//!
//! [`SignalingClient::connect`] returns only after the `register` envelope has
//! been written, so callers can signal as soon as it resolves. Inbound
//! envelopes are turned into [`SignalEvent`]s on an unbounded channel.

use super::{ClientEnvelope, EnvelopeKind, PeerId, ServerEnvelope, SignalData};
use crate::core::error::ProtocolError;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Fallback shown when the relay reports an error without a message.
const GENERIC_RELAY_ERROR: &str = "Connection failed.";

/// Inbound signaling, as seen by the handshake layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Offer, answer, candidate or decline payload from a peer.
    Signal { from: PeerId, data: SignalData },
    /// The peer answered our offer. Followed by the `Signal` carrying the answer.
    Accepted { from: PeerId },
    /// The peer declined our offer (or rejected it as busy).
    Declined { from: PeerId, reason: Option<String> },
    /// Relay-side failure, typically an unknown target.
    Error {
        message: String,
        target: Option<PeerId>,
    },
    /// The relay connection ended.
    Closed,
}

/// Outbound signaling seam used by the handshake state machine.
pub trait SignalSink: Send + Sync {
    /// Queue `data` for `target`. Never panics; a closed connection is
    /// reported as [`ProtocolError::ChannelClosed`].
    fn send(&self, target: &str, data: SignalData) -> Result<(), ProtocolError>;
}

/// Live connection to the relay.
pub struct SignalingClient {
    peer_id: PeerId,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Connect to `url`, register as `peer_id` and start the reader/writer tasks.
    pub async fn connect(
        url: &str,
        peer_id: PeerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>)> {
        let (ws, _response) = connect_async(url)
            .await
            .with_context(|| format!("relay unreachable at {url}"))?;
        let (mut sink, mut stream) = ws.split();

        let register = serde_json::to_string(&ClientEnvelope::Register {
            peer_id: peer_id.clone(),
        })?;
        sink.send(Message::Text(register))
            .await
            .context("failed to register with relay")?;
        info!(event = "relay_registered", %peer_id, url, "Registered with relay");

        let open = Arc::new(AtomicBool::new(true));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!(event = "relay_write_failure", %e, "Relay write failed");
                    break;
                }
            }
            writer_open.store(false, Ordering::Release);
            let _ = sink.close().await;
        });

        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch_text(&text, &event_tx),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(event = "relay_read_failure", %e, "Relay read failed");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::Release);
            info!(event = "relay_closed", "Relay connection closed");
            let _ = event_tx.send(SignalEvent::Closed);
        });

        Ok((
            Self {
                peer_id,
                outbound,
                open,
            },
            event_rx,
        ))
    }

    pub(crate) fn from_parts(
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<Message>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            peer_id,
            outbound,
            open,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        if self.outbound.send(Message::Close(None)).is_ok() {
            debug!(event = "relay_close_requested", peer_id = %self.peer_id);
        }
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, target: &str, data: SignalData) -> Result<(), ProtocolError> {
        if !self.is_open() {
            warn!(event = "signal_dropped", target, "Relay connection not open; signal not sent");
            return Err(ProtocolError::ChannelClosed);
        }
        let data =
            serde_json::to_value(&data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let text = serde_json::to_string(&ClientEnvelope::Signal {
            target: target.to_string(),
            data,
        })
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        self.outbound.send(Message::Text(text)).map_err(|_| {
            self.open.store(false, Ordering::Release);
            warn!(event = "signal_dropped", target, "Relay writer gone; signal not sent");
            ProtocolError::ChannelClosed
        })
    }
}

// ── Inbound dispatch ──────────────────────────────────────────────────────────

fn dispatch_text(text: &str, events: &mpsc::UnboundedSender<SignalEvent>) {
    match serde_json::from_str::<ServerEnvelope>(text) {
        Ok(envelope) => {
            for event in envelope_events(envelope) {
                let _ = events.send(event);
            }
        }
        Err(e) => warn!(event = "relay_message_invalid", %e, "Ignoring malformed relay message"),
    }
}

/// Translate one relay envelope into the events it implies, in order.
pub(crate) fn envelope_events(envelope: ServerEnvelope) -> Vec<SignalEvent> {
    if envelope.kind == EnvelopeKind::Error {
        return vec![SignalEvent::Error {
            message: envelope
                .message
                .unwrap_or_else(|| GENERIC_RELAY_ERROR.to_string()),
            target: envelope.target,
        }];
    }

    let Some(from) = envelope.from else {
        warn!(event = "relay_message_invalid", kind = ?envelope.kind, "Envelope without sender");
        return Vec::new();
    };
    let data: SignalData = match envelope.data.map(serde_json::from_value).transpose() {
        Ok(data) => data.unwrap_or_default(),
        Err(e) => {
            warn!(event = "signal_payload_invalid", %from, %e, "Ignoring malformed signal payload");
            return Vec::new();
        }
    };

    match envelope.kind {
        EnvelopeKind::Signal => vec![SignalEvent::Signal { from, data }],
        EnvelopeKind::Answer => vec![
            SignalEvent::Accepted { from: from.clone() },
            SignalEvent::Signal { from, data },
        ],
        EnvelopeKind::Decline => vec![SignalEvent::Declined {
            from,
            reason: data.reason,
        }],
        EnvelopeKind::Error => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signaling::{SdpKind, SessionDescription};
    use serde_json::json;

    #[test]
    fn answer_reports_acceptance_before_the_signal() {
        let data = SignalData::answer(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0".into(),
        });
        let env = ServerEnvelope::forwarded(
            EnvelopeKind::Answer,
            "bob",
            serde_json::to_value(&data).unwrap(),
        );
        let events = envelope_events(env);
        assert_eq!(
            events,
            vec![
                SignalEvent::Accepted { from: "bob".into() },
                SignalEvent::Signal {
                    from: "bob".into(),
                    data
                },
            ]
        );
    }

    #[test]
    fn decline_carries_reason() {
        let env = ServerEnvelope::forwarded(
            EnvelopeKind::Decline,
            "bob",
            json!({"type": "decline", "reason": "busy"}),
        );
        assert_eq!(
            envelope_events(env),
            vec![SignalEvent::Declined {
                from: "bob".into(),
                reason: Some("busy".into())
            }]
        );
    }

    #[test]
    fn error_without_message_gets_generic_text() {
        let mut env = ServerEnvelope::error("x", None);
        env.message = None;
        assert_eq!(
            envelope_events(env),
            vec![SignalEvent::Error {
                message: GENERIC_RELAY_ERROR.into(),
                target: None
            }]
        );
    }

    #[test]
    fn envelope_without_sender_is_dropped() {
        let env = ServerEnvelope {
            kind: EnvelopeKind::Signal,
            from: None,
            target: None,
            data: Some(json!({})),
            message: None,
        };
        assert!(envelope_events(env).is_empty());
    }

    #[test]
    fn send_on_closed_connection_reports_instead_of_panicking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let client = SignalingClient::from_parts("alice".into(), tx, open);

        let result = client.send("bob", SignalData::decline(None));
        assert_eq!(result, Err(ProtocolError::ChannelClosed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_writer_exit_marks_connection_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let open = Arc::new(AtomicBool::new(true));
        let client = SignalingClient::from_parts("alice".into(), tx, open);

        assert_eq!(
            client.send("bob", SignalData::decline(None)),
            Err(ProtocolError::ChannelClosed)
        );
        assert!(!client.is_open());
    }

    #[test]
    fn send_wraps_payload_in_signal_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client =
            SignalingClient::from_parts("alice".into(), tx, Arc::new(AtomicBool::new(true)));

        client
            .send("bob", SignalData::decline(Some("busy".into())))
            .unwrap();
        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "signal", "target": "bob", "data": {"type": "decline", "reason": "busy"}})
        );
    }
}
