//! # qtunnel
//!
//! Expose a service on a private network through a public rendezvous host,
//! without any inbound connectivity to the private side.
//!
//! The interior agent (client) dials out to the rendezvous host (server) and
//! keeps a single long-lived control channel open. Every external TCP session
//! accepted on a public port of the server becomes a logical stream
//! multiplexed onto that channel; the client bridges each stream to the
//! configured local service.
//!
//! ```text
//! external user ──► public port ─┐
//! external user ──► public port ─┤ server ══ control channel ══ client ──► local service
//! external user ──► public port ─┘          (PQC mTLS, framed)
//! ```
//!
//! The control channel can be wrapped in mutual-authentication TLS 1.3
//! restricted to post-quantum primitives (ML-KEM key exchange, ML-DSA
//! signatures); see [`transport`].

pub mod config;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::{ClientConfig, ServerConfig};
pub use tunnel::{Client, Server};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
