//! Reverse tunnel engines
//!
//! [`Server`] accepts control channels from interior clients and bridges
//! external TCP sessions onto them; [`Client`] dials the server, announces
//! its mapping, and bridges streams to the local service.

mod client;
mod server;
mod session;

pub use client::Client;
pub use server::Server;

use std::time::Duration;
use thiserror::Error;

/// Tunnel engine errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control channel write failed: {0}")]
    ControlWrite(std::io::Error),
}

/// Bytes pulled from a data socket per read
pub(crate) const READ_CHUNK_SIZE: usize = 4096;

/// Fixed delay between client reconnect attempts
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Timeout for dialing the local service on NEW_CONN
pub(crate) const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for dialing the server control port
pub(crate) const SERVER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the per-session command and data channels
pub(crate) const CHANNEL_DEPTH: usize = 256;
