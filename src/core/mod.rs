pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod relay;
pub mod signaling;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
