//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap (with `PORT` from the environment for the relay)
//! - TOML configuration file (`voidshare.toml` unless `--config` says otherwise)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{
    CHUNK_SIZE, DEFAULT_CONFIG_FILE, DEFAULT_ICE_SERVER, DEFAULT_RELAY_PORT, DEFAULT_RELAY_URL,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// VoidShare - encrypted peer-to-peer file sharing through a signaling relay.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// WebSocket URL of the signaling relay.
    #[clap(long, global = true)]
    pub relay_url: Option<String>,

    /// Peer id to register with. Random when omitted.
    #[clap(long, global = true)]
    pub peer_id: Option<String>,

    /// STUN/TURN server URL. Repeatable.
    #[clap(long = "ice-server", global = true)]
    pub ice_servers: Vec<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Append logs to this file as well as stderr.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration file. Missing files are ignored unless given explicitly.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling relay.
    Relay {
        /// Address to listen on.
        #[clap(long)]
        bind: Option<IpAddr>,

        /// Port to listen on.
        #[clap(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Connect to a peer and send it one file.
    Send {
        /// Peer id of the receiver.
        target: String,

        /// File to send.
        file: PathBuf,

        /// MIME type announced to the receiver.
        #[clap(long)]
        mime: Option<String>,

        /// Ciphertext bytes per data-channel message.
        #[clap(long)]
        chunk_size: Option<usize>,
    },

    /// Wait for offers and save received files.
    Receive {
        /// Directory received files are written to.
        #[clap(long)]
        out: Option<PathBuf>,

        /// Accept every offer without asking.
        #[clap(long)]
        yes: bool,

        /// Keep waiting for more files after the first one.
        #[clap(long)]
        keep_open: bool,
    },
}

/// Values accepted from the TOML file. Everything is optional.
#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub relay_url: Option<String>,
    pub peer_id: Option<String>,
    pub ice_servers: Option<Vec<String>>,
    pub verbose: Option<u8>,
    pub log_file: Option<PathBuf>,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub chunk_size: Option<usize>,
    pub out_dir: Option<PathBuf>,
}

/// Effective settings after merging file and CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub relay_url: String,
    pub peer_id: Option<String>,
    pub ice_servers: Vec<String>,
    pub verbose: u8,
    pub log_file: Option<PathBuf>,
    pub bind: IpAddr,
    pub port: u16,
    pub chunk_size: usize,
    pub out_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            peer_id: None,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            verbose: 0,
            log_file: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RELAY_PORT,
            chunk_size: CHUNK_SIZE,
            out_dir: PathBuf::from("."),
        }
    }
}

impl Args {
    /// Parse the command line and merge it over the config file.
    pub fn load() -> Result<(Self, Settings)> {
        let args = Args::parse();
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    FileConfig::from_file(default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        let settings = args.settings(file);
        Ok((args, settings))
    }

    /// Merge file config with CLI args (CLI takes precedence).
    pub fn settings(&self, file: FileConfig) -> Settings {
        let defaults = Settings::default();
        let mut settings = Settings {
            relay_url: file.relay_url.unwrap_or(defaults.relay_url),
            peer_id: file.peer_id,
            ice_servers: file.ice_servers.unwrap_or(defaults.ice_servers),
            verbose: file.verbose.unwrap_or(defaults.verbose),
            log_file: file.log_file,
            bind: file.bind.unwrap_or(defaults.bind),
            port: file.port.unwrap_or(defaults.port),
            chunk_size: file.chunk_size.unwrap_or(defaults.chunk_size),
            out_dir: file.out_dir.unwrap_or(defaults.out_dir),
        };

        if let Some(url) = &self.relay_url {
            settings.relay_url = url.clone();
        }
        if self.peer_id.is_some() {
            settings.peer_id = self.peer_id.clone();
        }
        if !self.ice_servers.is_empty() {
            settings.ice_servers = self.ice_servers.clone();
        }
        if self.verbose > 0 {
            settings.verbose = self.verbose;
        }
        if self.log_file.is_some() {
            settings.log_file = self.log_file.clone();
        }

        match &self.command {
            Command::Relay { bind, port } => {
                if let Some(bind) = bind {
                    settings.bind = *bind;
                }
                if let Some(port) = port {
                    settings.port = *port;
                }
            }
            Command::Send { chunk_size, .. } => {
                if let Some(size) = chunk_size {
                    settings.chunk_size = *size;
                }
            }
            Command::Receive { out, .. } => {
                if let Some(out) = out {
                    settings.out_dir = out.clone();
                }
            }
        }

        settings.chunk_size = settings.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        settings
    }
}

impl FileConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }
}
