//! Error types for packet ingestion.
use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced while parsing and validating incoming packets.
///
/// All of these are local to a single packet: the processor logs the error,
/// bumps the error counter, and drops the packet. Nothing here is fatal.
#[derive(Error, Debug)]
pub enum FogError {
    #[error("invalid packet from {addr}: {reason}")]
    InvalidPacket { addr: SocketAddr, reason: String },

    #[error("bad password from {0}")]
    BadPassword(SocketAddr),
}

impl FogError {
    pub(crate) fn invalid(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::InvalidPacket {
            addr,
            reason: reason.into(),
        }
    }
}
