//! Session engine: one task per local peer that owns the handshake, the key
//! exchange and any in-flight transfers.
//!
//! Every input (relay signals, user commands, transport events, finished
//! sends) lands on a single queue and is handled in arrival order, so the
//! handshake never races itself. The UI layer talks to the engine through a
//! [`SessionHandle`] and listens to [`SessionEvent`]s.

use crate::core::connection::crypto::{EphemeralKeypair, KeyExchange, SharedSecret};
use crate::core::connection::handshake::{Handshake, HandshakeEvent, HandshakeState};
use crate::core::connection::transport::{ChannelMessage, PeerTransport, TransportEvent, TransportFactory};
use crate::core::error::ProtocolError;
use crate::core::signaling::client::{SignalEvent, SignalSink};
use crate::core::signaling::PeerId;
use crate::core::transfer::receiver::{ReceivedFile, TransferSession};
use crate::core::transfer::sender::{self, Cancelled, OutgoingFile};
use crate::core::transfer::{parse_inbound, AppMessage, Inbound, Progress};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local_id: PeerId,
    pub chunk_size: usize,
}

/// User-initiated operations.
#[derive(Debug, Clone)]
pub enum Command {
    Connect(PeerId),
    Accept(PeerId),
    Decline(PeerId),
    SendFile(OutgoingFile),
    Disconnect,
    Shutdown,
}

/// What the engine reports to the UI layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    OfferReceived { from: PeerId },
    Accepted { peer: PeerId },
    Declined { peer: PeerId, reason: Option<String> },
    /// An offer arrived while a session was live and was auto-declined.
    BusyRejected { from: PeerId },
    /// The relay could not route our offer. Carries [`ProtocolError::PeerNotFound`].
    PeerNotFound(ProtocolError),
    ChannelReady { peer: Option<PeerId> },
    KeyEstablished { peer: Option<PeerId> },
    SendProgress(Progress),
    SendComplete { name: String },
    ReceiveStarted { name: String, size: u64 },
    ReceiveProgress(Progress),
    FileReceived(ReceivedFile),
    TransferFailed(ProtocolError),
    /// The peer said goodbye or the channel dropped.
    PeerDisconnected { peer: Option<PeerId> },
    /// Our own disconnect completed.
    Disconnected { peer: Option<PeerId> },
    ChannelSendFailed(String),
    RelayClosed,
    Error(String),
}

enum SessionInput {
    Signal(SignalEvent),
    Command(Command),
    Transport { generation: u64, event: TransportEvent },
    SendFinished { id: u64, name: String, result: Result<()> },
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    local_id: PeerId,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl SessionHandle {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inputs
            .send(SessionInput::Command(command))
            .map_err(|_| anyhow!("session has shut down"))
    }

    pub fn connect(&self, target: impl Into<PeerId>) -> Result<()> {
        self.command(Command::Connect(target.into()))
    }

    pub fn accept(&self, from: impl Into<PeerId>) -> Result<()> {
        self.command(Command::Accept(from.into()))
    }

    pub fn decline(&self, from: impl Into<PeerId>) -> Result<()> {
        self.command(Command::Decline(from.into()))
    }

    pub fn send_file(&self, file: OutgoingFile) -> Result<()> {
        self.command(Command::SendFile(file))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }
}

struct OutgoingTransfer {
    id: u64,
    stop: SignalOfStop,
}

pub struct PeerSession {
    config: SessionConfig,
    handshake: Handshake,
    keys: KeyExchange,
    incoming: Option<TransferSession>,
    outgoing: Option<OutgoingTransfer>,
    next_transfer_id: u64,
    channel_open: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    inputs: mpsc::UnboundedSender<SessionInput>,
}

impl PeerSession {
    /// Start the engine task. `signals` is the inbound half of the relay
    /// connection whose outbound half is `signaling`.
    pub fn spawn(
        config: SessionConfig,
        signaling: Arc<dyn SignalSink>,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
        factory: Arc<dyn TransportFactory>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel::<(u64, TransportEvent)>();

        let tx = input_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if tx.send(SessionInput::Signal(signal)).is_err() {
                    break;
                }
            }
        });
        let tx = input_tx.clone();
        tokio::spawn(async move {
            while let Some((generation, event)) = transport_rx.recv().await {
                if tx.send(SessionInput::Transport { generation, event }).is_err() {
                    break;
                }
            }
        });

        let session = PeerSession {
            handshake: Handshake::new(config.local_id.clone(), signaling, factory, transport_tx),
            keys: KeyExchange::new(EphemeralKeypair::generate()),
            incoming: None,
            outgoing: None,
            next_transfer_id: 0,
            channel_open: false,
            events: event_tx,
            inputs: input_tx.clone(),
            config: config.clone(),
        };
        tokio::spawn(session.run(input_rx));

        (
            SessionHandle {
                local_id: config.local_id,
                inputs: input_tx,
            },
            event_rx,
        )
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        info!(event = "session_start", local_id = %self.config.local_id);
        while let Some(input) = inputs.recv().await {
            match input {
                SessionInput::Command(Command::Shutdown) => {
                    self.clear_session().await;
                    break;
                }
                SessionInput::Command(command) => self.on_command(command).await,
                SessionInput::Signal(signal) => self.on_signal(signal).await,
                SessionInput::Transport { generation, event } => {
                    self.on_transport(generation, event).await
                }
                SessionInput::SendFinished { id, name, result } => {
                    self.on_send_finished(id, name, result)
                }
            }
        }
        info!(event = "session_stop", local_id = %self.config.local_id);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn peer(&self) -> Option<PeerId> {
        self.handshake.remote().map(str::to_string)
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(target) => {
                if let Err(e) = self.handshake.create_connection(&target).await {
                    self.emit(SessionEvent::Error(format!("cannot connect to {target}: {e}")));
                }
            }
            Command::Accept(from) => {
                if let Err(e) = self.handshake.accept_offer(&from).await {
                    self.emit(SessionEvent::Error(format!("cannot accept {from}: {e}")));
                }
            }
            Command::Decline(from) => {
                if let Err(e) = self.handshake.decline_offer(&from).await {
                    self.emit(SessionEvent::Error(format!("cannot decline {from}: {e}")));
                }
            }
            Command::SendFile(file) => self.start_send(file),
            Command::Disconnect => self.disconnect_local().await,
            Command::Shutdown => {}
        }
    }

    fn start_send(&mut self, file: OutgoingFile) {
        if self.outgoing.is_some() {
            warn!(event = "send_refused", name = %file.name, "A file is already being sent");
            self.emit(SessionEvent::TransferFailed(ProtocolError::Busy));
            return;
        }
        let Some(transport) = self.handshake.transport().filter(|t| t.is_channel_open()) else {
            self.emit(SessionEvent::TransferFailed(ProtocolError::NotConnected));
            return;
        };
        let Some(secret) = self.keys.secret().cloned() else {
            self.emit(SessionEvent::TransferFailed(ProtocolError::KeyNotEstablished));
            return;
        };

        self.next_transfer_id += 1;
        let id = self.next_transfer_id;
        let stop = SignalOfStop::new();
        let name = file.name.clone();
        let events = self.events.clone();
        let inputs = self.inputs.clone();
        let chunk_size = self.config.chunk_size;
        let task_stop = stop.clone();

        tokio::spawn(async move {
            let result = send_file(transport, file, secret, chunk_size, task_stop, events).await;
            let _ = inputs.send(SessionInput::SendFinished { id, name, result });
        });
        self.outgoing = Some(OutgoingTransfer { id, stop });
    }

    fn on_send_finished(&mut self, id: u64, name: String, result: Result<()>) {
        if self.outgoing.as_ref().map(|o| o.id) != Some(id) {
            debug!(event = "send_result_stale", id, %name);
            return;
        }
        self.outgoing = None;
        match result {
            Ok(()) => self.emit(SessionEvent::SendComplete { name }),
            Err(e) if e.is::<Cancelled>() => debug!(event = "send_cancelled", %name),
            Err(e) => {
                warn!(event = "send_failed", %name, error = %e);
                match e.downcast_ref::<ProtocolError>() {
                    Some(ProtocolError::ChannelClosed) => {
                        self.emit(SessionEvent::ChannelSendFailed(e.to_string()))
                    }
                    Some(pe) => self.emit(SessionEvent::TransferFailed(pe.clone())),
                    None => self.emit(SessionEvent::Error(format!("sending {name} failed: {e}"))),
                }
            }
        }
    }

    /// Stop sending, notify the peer, then tear everything down. A no-op
    /// without a session.
    async fn disconnect_local(&mut self) {
        // No chunk or end marker may follow the notice.
        if let Some(outgoing) = &self.outgoing {
            outgoing.stop.cancel();
        }
        if let Some(transport) = self.handshake.transport().filter(|t| t.is_channel_open()) {
            if let Err(e) = self.send_app(transport.as_ref(), &AppMessage::Disconnect).await {
                warn!(event = "disconnect_notice_failed", error = %e);
            }
        }
        let peer = self.peer();
        if self.clear_session().await {
            info!(event = "session_disconnected", peer = peer.as_deref().unwrap_or(""), "Disconnected");
            self.emit(SessionEvent::Disconnected { peer });
        } else {
            debug!(event = "disconnect_noop", "No active session");
        }
    }

    /// Cancel transfers, forget the peer's key and reset the handshake.
    async fn clear_session(&mut self) -> bool {
        let mut cleared = false;
        self.channel_open = false;
        if let Some(outgoing) = self.outgoing.take() {
            outgoing.stop.cancel();
            cleared = true;
        }
        if let Some(incoming) = self.incoming.take() {
            debug!(event = "receive_abandoned", name = %incoming.metadata().name, received = incoming.received_bytes());
            cleared = true;
        }
        cleared |= self.keys.reset();
        cleared |= self.handshake.reset().await;
        cleared
    }

    // ── Signaling ────────────────────────────────────────────────────────────

    async fn on_signal(&mut self, signal: SignalEvent) {
        match signal {
            SignalEvent::Signal { from, data } => match self.handshake.handle_signal(&from, data).await {
                Ok(Some(event)) => self.on_handshake_event(event),
                Ok(None) => {}
                Err(e) => {
                    warn!(event = "signal_failed", %from, error = %e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            },
            SignalEvent::Accepted { from } => {
                if self.handshake.state() == HandshakeState::AwaitingAnswer
                    && self.handshake.remote() == Some(from.as_str())
                {
                    self.emit(SessionEvent::Accepted { peer: from });
                }
            }
            SignalEvent::Declined { from, reason } => {
                if let Some(event) = self.handshake.declined(&from, reason).await {
                    self.on_handshake_event(event);
                }
            }
            SignalEvent::Error { message, target } => {
                warn!(event = "relay_error", %message, target = target.as_deref().unwrap_or(""));
                match target {
                    Some(peer) => {
                        self.handshake.peer_unreachable(&peer).await;
                        self.emit(SessionEvent::PeerNotFound(ProtocolError::PeerNotFound(peer)));
                    }
                    None => self.emit(SessionEvent::Error(message)),
                }
            }
            SignalEvent::Closed => {
                warn!(event = "relay_lost", "Relay connection closed; established channels stay up");
                self.emit(SessionEvent::RelayClosed);
            }
        }
    }

    fn on_handshake_event(&self, event: HandshakeEvent) {
        match event {
            HandshakeEvent::OfferReceived { from } => self.emit(SessionEvent::OfferReceived { from }),
            HandshakeEvent::AnswerApplied { from } => debug!(event = "answer_applied", %from),
            HandshakeEvent::Declined { from, reason } => {
                self.emit(SessionEvent::Declined { peer: from, reason })
            }
            HandshakeEvent::BusyRejected { from } => self.emit(SessionEvent::BusyRejected { from }),
        }
    }

    // ── Transport ────────────────────────────────────────────────────────────

    async fn on_transport(&mut self, generation: u64, event: TransportEvent) {
        if !self.handshake.is_current(generation) {
            debug!(event = "transport_event_stale", generation, ?event);
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => self.handshake.send_local_candidate(candidate),
            TransportEvent::ChannelOpen => {
                self.channel_open = true;
                info!(event = "channel_ready", peer = self.handshake.remote().unwrap_or(""));
                self.emit(SessionEvent::ChannelReady { peer: self.peer() });
                if let Some(key) = self.keys.on_channel_open() {
                    self.send_control(AppMessage::PublicKey { key: key.to_vec() }).await;
                }
            }
            TransportEvent::Message(message) => self.on_channel_message(message).await,
            TransportEvent::ChannelClosed => {
                // The answer or a decline can still arrive over the relay.
                if !self.channel_open && self.handshake.state() == HandshakeState::AwaitingAnswer {
                    debug!(event = "channel_closed_before_open", peer = self.handshake.remote().unwrap_or(""));
                    return;
                }
                let peer = self.peer();
                if self.clear_session().await {
                    warn!(event = "channel_lost", peer = peer.as_deref().unwrap_or(""), "Channel closed");
                    self.emit(SessionEvent::PeerDisconnected { peer });
                }
            }
        }
    }

    async fn send_app(&self, transport: &dyn PeerTransport, message: &AppMessage) -> Result<()> {
        transport.send(message.to_channel_message()?).await
    }

    /// Send a control message on the live channel, reporting failures as events.
    async fn send_control(&self, message: AppMessage) {
        let Some(transport) = self.handshake.transport() else {
            warn!(event = "control_unsent", "No transport for control message");
            return;
        };
        if let Err(e) = self.send_app(transport.as_ref(), &message).await {
            warn!(event = "channel_send_failed", error = %e);
            self.emit(SessionEvent::ChannelSendFailed(e.to_string()));
        }
    }

    async fn on_channel_message(&mut self, message: ChannelMessage) {
        let inbound = match parse_inbound(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(event = "channel_message_invalid", error = %e, "Ignoring unrecognized message");
                return;
            }
        };

        match inbound {
            Inbound::App(AppMessage::PublicKey { key }) => match self.keys.on_remote_key(&key) {
                Ok(reply) => {
                    if let Some(own) = reply {
                        self.send_control(AppMessage::PublicKey { key: own.to_vec() }).await;
                    }
                    info!(event = "key_established", peer = self.handshake.remote().unwrap_or(""));
                    self.emit(SessionEvent::KeyEstablished { peer: self.peer() });
                }
                Err(e) => {
                    warn!(event = "remote_key_rejected", error = %e);
                    self.emit(SessionEvent::Error(e.to_string()));
                }
            },
            Inbound::App(AppMessage::Metadata(metadata)) => {
                let (name, size) = (metadata.name.clone(), metadata.size);
                match TransferSession::start(metadata) {
                    Ok(session) => {
                        if let Some(previous) = self.incoming.replace(session) {
                            warn!(event = "receive_superseded", name = %previous.metadata().name);
                        }
                        self.emit(SessionEvent::ReceiveStarted { name, size });
                    }
                    Err(e) => {
                        warn!(event = "metadata_rejected", %name, error = %e);
                        self.emit(SessionEvent::TransferFailed(e));
                    }
                }
            }
            Inbound::App(AppMessage::Disconnect) => {
                let peer = self.peer();
                if self.clear_session().await {
                    info!(event = "peer_disconnected", peer = peer.as_deref().unwrap_or(""), "Peer disconnected");
                    self.emit(SessionEvent::PeerDisconnected { peer });
                }
            }
            Inbound::Chunk(bytes) => match self.incoming.as_mut() {
                Some(session) => match session.push_chunk(bytes) {
                    Ok(progress) => self.emit(SessionEvent::ReceiveProgress(progress)),
                    Err(e) => {
                        self.incoming = None;
                        self.emit(SessionEvent::TransferFailed(e));
                    }
                },
                None => warn!(event = "chunk_unexpected", len = bytes.len(), "Chunk without metadata"),
            },
            Inbound::End => self.finish_incoming().await,
        }
    }

    async fn finish_incoming(&mut self) {
        let Some(session) = self.incoming.take() else {
            warn!(event = "end_unexpected", "End marker without a transfer in progress");
            return;
        };
        let Some(secret) = self.keys.secret().cloned() else {
            self.emit(SessionEvent::TransferFailed(ProtocolError::KeyNotEstablished));
            return;
        };

        let size = session.metadata().size;
        match tokio::task::spawn_blocking(move || session.finish(&secret)).await {
            Ok(Ok(file)) => {
                self.emit(SessionEvent::ReceiveProgress(Progress {
                    transferred: size,
                    total: size,
                    finished: true,
                }));
                self.emit(SessionEvent::FileReceived(file));
            }
            Ok(Err(e)) => self.emit(SessionEvent::TransferFailed(e)),
            Err(e) => self.emit(SessionEvent::Error(format!("receive task failed: {e}"))),
        }
    }
}

async fn send_file(
    transport: Arc<dyn PeerTransport>,
    file: OutgoingFile,
    secret: SharedSecret,
    chunk_size: usize,
    stop: SignalOfStop,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Result<()> {
    let prepared = tokio::task::spawn_blocking(move || sender::prepare(&file, &secret)).await??;
    sender::stream(transport.as_ref(), &prepared, chunk_size, &stop, |progress| {
        let _ = events.send(SessionEvent::SendProgress(progress));
    })
    .await
}
