//! webrtc-rs implementation of [`PeerTransport`].
//!
//! Candidates are trickled: every locally gathered candidate is surfaced as
//! a [`TransportEvent::LocalCandidate`] as soon as webrtc-rs reports it, and
//! remote candidates are applied one by one. Binary sends respect the data
//! channel's buffered amount so large files do not balloon the SCTP queue.

use super::transport::{ChannelMessage, PeerTransport, Role, TransportEvent, TransportFactory};
use crate::core::config::{
    DATA_CHANNEL_LABEL, DC_BACKPRESSURE_MAX_WAIT, DC_BUFFERED_AMOUNT_HIGH, DC_CLOSE_DRAIN_TIMEOUT,
    DC_DRAIN_POLL_INTERVAL, DEFAULT_ICE_SERVER,
};
use crate::core::error::ProtocolError;
use crate::core::signaling::{IceCandidate, SdpKind, SessionDescription};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Opens webrtc-rs peer connections against a fixed ICE server list.
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        let urls = if self.ice_servers.is_empty() {
            vec![DEFAULT_ICE_SERVER.to_string()]
        } else {
            self.ice_servers.clone()
        };
        vec![RTCIceServer {
            urls,
            ..Default::default()
        }]
    }
}

async fn create_webrtc_api() -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;
    Ok(APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let api = create_webrtc_api().await?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.rtc_ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(event = "candidate_encode_failure", %e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s| {
            let tx = tx.clone();
            Box::pin(async move {
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "WebRTC connection failed");
                        let _ = tx.send(TransportEvent::ChannelClosed);
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(
                            event = "webrtc_disconnected",
                            "WebRTC transient disconnect (ICE may recover)"
                        );
                    }
                    RTCPeerConnectionState::Closed => {
                        debug!(event = "webrtc_closed", "WebRTC connection closed");
                    }
                    _ => {}
                }
            })
        }));

        let channel: ChannelSlot = Arc::new(RwLock::new(None));
        match role {
            Role::Offerer => {
                // Ordered and fully reliable: the transfer protocol depends on it.
                let dc = pc
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                *channel.write().await = Some(dc.clone());
                attach_dc_handlers(&dc, events);
            }
            Role::Answerer => {
                let slot = channel.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        info!(event = "dc_received", channel = %dc.label(), "Remote data channel announced");
                        *slot.write().await = Some(dc.clone());
                        attach_dc_handlers(&dc, events);
                    })
                }));
            }
        }

        Ok(Arc::new(RtcTransport { pc, channel }))
    }
}

/// The slot is filled before handlers are attached, so a `ChannelOpen`
/// consumer always finds the channel.
fn attach_dc_handlers(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            info!(event = "dc_open", channel = %label, "DataChannel open");
            let _ = tx.send(TransportEvent::ChannelOpen);
        })
    }));

    let tx = events.clone();
    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "DataChannel closed by transport");
            let _ = tx.send(TransportEvent::ChannelClosed);
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, error = %err, "DataChannel error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = events.clone();
        Box::pin(async move {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data.to_vec())
            };
            let _ = tx.send(TransportEvent::Message(message));
        })
    }));
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl RtcTransport {
    async fn open_channel(&self) -> Result<Arc<RTCDataChannel>> {
        match self.channel.read().await.as_ref() {
            Some(dc) if dc.ready_state() == RTCDataChannelState::Open => Ok(dc.clone()),
            _ => Err(ProtocolError::ChannelClosed.into()),
        }
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => bail!("unsupported session description type {other}"),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

/// Wait until the channel's send buffer has room for `next_msg_size` bytes.
/// After [`DC_BACKPRESSURE_MAX_WAIT`] the message is queued anyway.
async fn wait_for_buffer_space(dc: &Arc<RTCDataChannel>, next_msg_size: usize) -> Result<()> {
    if dc.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
        return Ok(());
    }

    debug!(
        channel = %dc.label(),
        next_msg = next_msg_size,
        high_watermark = DC_BUFFERED_AMOUNT_HIGH,
        "Applying backpressure - waiting for buffer to drain"
    );

    let deadline = Instant::now() + DC_BACKPRESSURE_MAX_WAIT;
    loop {
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(ProtocolError::ChannelClosed.into());
        }
        if dc.buffered_amount().await + next_msg_size <= DC_BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(channel = %dc.label(), "Buffer drain timeout - proceeding anyway");
            return Ok(());
        }
        tokio::time::sleep(DC_DRAIN_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn send(&self, message: ChannelMessage) -> Result<()> {
        let dc = self.open_channel().await?;
        match message {
            ChannelMessage::Text(text) => {
                dc.send_text(text).await?;
            }
            ChannelMessage::Binary(data) => {
                wait_for_buffer_space(&dc, data.len()).await?;
                dc.send(&Bytes::from(data)).await?;
            }
        }
        Ok(())
    }

    fn is_channel_open(&self) -> bool {
        self.channel
            .try_read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|dc| dc.ready_state() == RTCDataChannelState::Open))
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        let dc = self.channel.read().await.clone();
        if let Some(dc) = dc {
            let deadline = Instant::now() + DC_CLOSE_DRAIN_TIMEOUT;
            while dc.ready_state() == RTCDataChannelState::Open
                && dc.buffered_amount().await > 0
                && Instant::now() < deadline
            {
                tokio::time::sleep(DC_DRAIN_POLL_INTERVAL).await;
            }
        }
        self.pc
            .close()
            .await
            .map_err(|e| anyhow!("failed to close peer connection: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_conversion_keeps_kind_and_sdp() {
        let desc = SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".into(),
        };
        let rtc = to_rtc(desc.clone()).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc(rtc).unwrap(), desc);
    }

    #[test]
    fn empty_ice_list_falls_back_to_default_stun() {
        let servers = RtcTransportFactory::new(Vec::new()).rtc_ice_servers();
        assert_eq!(servers[0].urls, vec![DEFAULT_ICE_SERVER.to_string()]);

        let custom = RtcTransportFactory::new(vec!["stun:example.org:3478".into()]).rtc_ice_servers();
        assert_eq!(custom[0].urls, vec!["stun:example.org:3478".to_string()]);
    }

    #[tokio::test]
    async fn offerer_produces_offer_and_reports_closed_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RtcTransportFactory::new(Vec::new())
            .open(Role::Offerer, tx)
            .await
            .unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=application"));
        assert!(!transport.is_channel_open());

        let err = transport
            .send(ChannelMessage::Text("hi".into()))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::ChannelClosed)
        );
        transport.close().await.unwrap();
    }
}
