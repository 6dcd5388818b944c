//! Transport layer for the control channel
//!
//! The engines run over anything implementing the tokio IO traits; this
//! module provides the PQC mutual-TLS wrapper used when `tls.enabled` is set.
//! Without TLS the control channel is a plain `TcpStream`.

mod pqc;

pub use pqc::{PqcAcceptor, PqcConnector};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),
}
