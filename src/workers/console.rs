//! Console front-end: the `relay`, `send` and `receive` subcommands.
//!
//! Each command drives a [`PeerSession`] (or the relay server) and renders
//! its events on the terminal. Ctrl-C cancels through [`SignalOfStop`].

use super::args::Settings;
use crate::core::connection::webrtc::RtcTransportFactory;
use crate::core::engine::{PeerSession, SessionConfig, SessionEvent, SessionHandle};
use crate::core::relay::server;
use crate::core::relay::Relay;
use crate::core::signaling::client::SignalingClient;
use crate::core::signaling::generate_peer_id;
use crate::core::transfer::receiver::ReceivedFile;
use crate::core::transfer::sender::OutgoingFile;
use crate::core::transfer::Progress;
use crate::utils::atomic_write::{atomic_write, sanitize_file_name, unique_path};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

// ── Relay ────────────────────────────────────────────────────────────────────

pub async fn run_relay(settings: &Settings, stop: SignalOfStop) -> Result<()> {
    let addr = SocketAddr::new(settings.bind, settings.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;
    server::serve(listener, Arc::new(Relay::new()), stop).await
}

// ── Peer plumbing ────────────────────────────────────────────────────────────

struct Peer {
    client: Arc<SignalingClient>,
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Peer {
    async fn connect(settings: &Settings) -> Result<Self> {
        let peer_id = settings.peer_id.clone().unwrap_or_else(generate_peer_id);
        let (client, signals) = SignalingClient::connect(&settings.relay_url, peer_id.clone()).await?;
        let client = Arc::new(client);
        let factory = Arc::new(RtcTransportFactory::new(settings.ice_servers.clone()));
        let config = SessionConfig {
            local_id: peer_id,
            chunk_size: settings.chunk_size,
        };
        let (handle, events) = PeerSession::spawn(config, client.clone(), signals, factory);
        Ok(Self {
            client,
            handle,
            events,
        })
    }

    /// Next engine event, or `None` on Ctrl-C or engine exit.
    async fn next(&mut self, stop: &SignalOfStop) -> Option<SessionEvent> {
        tokio::select! {
            event = self.events.recv() => event,
            _ = stop.wait() => None,
        }
    }

    /// Say goodbye to the peer and wait until the engine confirms.
    async fn disconnect(&mut self) {
        if self.handle.disconnect().is_err() {
            return;
        }
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::Disconnected { peer } | SessionEvent::PeerDisconnected { peer } => {
                    info!(event = "session_closed", peer = peer.as_deref().unwrap_or(""));
                    break;
                }
                _ => {}
            }
        }
    }

    fn shutdown(self) {
        let _ = self.handle.shutdown();
        self.client.close();
    }
}

fn progress_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{msg:30!} [{bar:40.cyan/blue}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(label.to_string());
    bar
}

fn show_progress(bar: &ProgressBar, progress: Progress) {
    bar.set_position(progress.percent().floor() as u64);
}

// ── Send ─────────────────────────────────────────────────────────────────────

pub async fn run_send(
    settings: &Settings,
    target: &str,
    path: &Path,
    mime: Option<String>,
    stop: SignalOfStop,
) -> Result<()> {
    let file = OutgoingFile::from_path(path, mime).await?;
    let mut peer = Peer::connect(settings).await?;
    println!("Your peer id: {}", peer.handle.local_id());
    println!("Connecting to {target}...");
    peer.handle.connect(target)?;

    let result = send_loop(&mut peer, file, &stop).await;
    if let Ok(true) = result {
        peer.disconnect().await;
    }
    peer.shutdown();
    result.map(|_| ())
}

/// Drive one send to completion. `Ok(true)` while the session is still up.
async fn send_loop(peer: &mut Peer, file: OutgoingFile, stop: &SignalOfStop) -> Result<bool> {
    let mut pending = Some(file);
    let mut bar: Option<ProgressBar> = None;
    let mut delivered = false;

    loop {
        let Some(event) = peer.next(stop).await else {
            bail!("cancelled");
        };
        match event {
            SessionEvent::Accepted { peer: remote } => println!("{remote} accepted, opening channel..."),
            SessionEvent::Declined { peer: remote, reason } => match reason {
                Some(reason) => bail!("{remote} declined the connection ({reason})"),
                None => bail!("{remote} declined the connection"),
            },
            SessionEvent::PeerNotFound(e) => bail!(e),
            SessionEvent::ChannelReady { peer: remote } => {
                println!("Channel open with {}, exchanging keys...", remote.unwrap_or_default())
            }
            SessionEvent::KeyEstablished { .. } => {
                if let Some(file) = pending.take() {
                    bar = Some(progress_bar(&file.name));
                    peer.handle.send_file(file)?;
                }
            }
            SessionEvent::SendProgress(progress) => {
                delivered |= progress.finished;
                if let Some(bar) = &bar {
                    show_progress(bar, progress);
                }
            }
            SessionEvent::SendComplete { name } => {
                if let Some(bar) = bar.take() {
                    bar.finish_with_message(format!("{name} sent"));
                }
                return Ok(true);
            }
            SessionEvent::TransferFailed(e) => bail!("transfer failed: {e}"),
            SessionEvent::ChannelSendFailed(e) => bail!("data channel failed: {e}"),
            // The receiver hangs up once it has the file.
            SessionEvent::PeerDisconnected { .. } if delivered => return Ok(false),
            SessionEvent::PeerDisconnected { .. } => bail!("peer disconnected"),
            SessionEvent::RelayClosed if pending.is_some() => bail!("lost the relay before connecting"),
            SessionEvent::RelayClosed => warn!(event = "relay_lost_mid_transfer", "Relay gone; continuing"),
            SessionEvent::Error(e) => warn!(event = "session_error", error = %e),
            other => tracing::debug!(event = "session_event", ?other),
        }
    }
}

// ── Receive ──────────────────────────────────────────────────────────────────

pub async fn run_receive(settings: &Settings, yes: bool, keep_open: bool, stop: SignalOfStop) -> Result<()> {
    let mut peer = Peer::connect(settings).await?;
    println!("Your peer id: {}", peer.handle.local_id());
    println!("Waiting for a sender. Files are saved to {}", settings.out_dir.display());

    let result = receive_loop(&mut peer, &settings.out_dir, yes, keep_open, &stop).await;
    peer.shutdown();
    result
}

async fn receive_loop(
    peer: &mut Peer,
    out_dir: &Path,
    yes: bool,
    keep_open: bool,
    stop: &SignalOfStop,
) -> Result<()> {
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = peer.next(stop).await {
        match event {
            SessionEvent::OfferReceived { from } => {
                let accept = if yes {
                    true
                } else {
                    match confirm(&format!("Accept connection from {from}?"), stop).await? {
                        Some(answer) => answer,
                        None => break,
                    }
                };
                if accept {
                    peer.handle.accept(from)?;
                } else {
                    peer.handle.decline(from)?;
                }
            }
            SessionEvent::BusyRejected { from } => println!("Turned away {from}: already in a session"),
            SessionEvent::KeyEstablished { peer: remote } => {
                println!("Secure channel with {}", remote.unwrap_or_default())
            }
            SessionEvent::ReceiveStarted { name, size } => {
                info!(event = "incoming_file", %name, size);
                bar = Some(progress_bar(&name));
            }
            SessionEvent::ReceiveProgress(progress) => {
                if let Some(bar) = &bar {
                    show_progress(bar, progress);
                }
            }
            SessionEvent::FileReceived(file) => {
                let path = save(out_dir, file).await?;
                if let Some(bar) = bar.take() {
                    bar.finish_with_message("saved");
                }
                println!("Saved {}", path.display());
                if !keep_open {
                    peer.disconnect().await;
                    return Ok(());
                }
            }
            SessionEvent::TransferFailed(e) => {
                if let Some(bar) = bar.take() {
                    bar.abandon_with_message("failed");
                }
                if !keep_open {
                    bail!("transfer failed: {e}");
                }
                eprintln!("Transfer failed: {e}");
            }
            SessionEvent::PeerDisconnected { peer: remote } => {
                if let Some(bar) = bar.take() {
                    bar.abandon_with_message("interrupted");
                }
                println!("{} disconnected", remote.unwrap_or_else(|| "peer".into()));
            }
            SessionEvent::RelayClosed => bail!("relay connection lost"),
            SessionEvent::Error(e) => warn!(event = "session_error", error = %e),
            other => tracing::debug!(event = "session_event", ?other),
        }
    }
    Ok(())
}

async fn save(out_dir: &Path, file: ReceivedFile) -> Result<PathBuf> {
    let out_dir = out_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("cannot create {}", out_dir.display()))?;
        let path = unique_path(&out_dir, &sanitize_file_name(&file.name));
        atomic_write(&path, &file.data)?;
        info!(event = "file_saved", path = %path.display(), bytes = file.data.len());
        Ok(path)
    })
    .await?
}

/// Ask a yes/no question on stdin. Anything but `y`/`yes` means no.
/// `None` if `stop` fires before an answer arrives.
async fn confirm(question: &str, stop: &SignalOfStop) -> Result<Option<bool>> {
    let question = question.to_string();
    confirm_with(
        move || {
            let mut stdout = std::io::stdout();
            write!(stdout, "{question} [y/N] ")?;
            stdout.flush()?;
            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer)?;
            Ok(answer)
        },
        stop,
    )
    .await
}

/// Run a blocking `read` on the blocking pool, raced against `stop`. The
/// reader is left behind on cancellation; the process exits without it.
async fn confirm_with<F>(read: F, stop: &SignalOfStop) -> Result<Option<bool>>
where
    F: FnOnce() -> std::io::Result<String> + Send + 'static,
{
    let reader = tokio::task::spawn_blocking(read);
    tokio::select! {
        answer = reader => {
            let answer = answer.map_err(|e| anyhow!("prompt failed: {e}"))??;
            Ok(Some(parse_answer(&answer)))
        }
        _ = stop.wait() => {
            println!();
            Ok(None)
        }
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
