//! axum front-end for the relay.
//!
//! A single route serves both purposes: WebSocket upgrades join the relay,
//! plain GETs get a liveness string.

use super::{PeerLink, Relay, RelayConnection};
use crate::core::signaling::ServerEnvelope;
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const HEALTH_TEXT: &str = "VoidShare signaling relay is running";

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new().route("/", get(root)).with_state(relay)
}

async fn root(ws: Option<WebSocketUpgrade>, State(relay): State<Arc<Relay>>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| serve_socket(socket, relay)),
        None => HEALTH_TEXT.into_response(),
    }
}

async fn serve_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();
    let mut connection = RelayConnection::new(relay, PeerLink::new(tx));

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = "relay_encode_failure", %e, "Dropping unencodable envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => connection.handle_text(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(event = "relay_socket_error", %e);
                break;
            }
        }
    }

    connection.close().await;
    let _ = writer.await;
}

/// Serve the relay on `listener` until `stop` fires.
pub async fn serve(listener: TcpListener, relay: Arc<Relay>, stop: SignalOfStop) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(event = "relay_listening", %addr, "Signaling relay listening");

    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move { stop.wait().await })
        .await?;

    info!(event = "relay_stopped", "Signaling relay stopped");
    Ok(())
}
