pub mod crypto;
pub mod handshake;
pub mod transport;
pub mod webrtc;
