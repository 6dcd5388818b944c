//! Post-quantum mutual-authentication TLS for the control channel
//!
//! TLS 1.3 only, with key exchange restricted to the ML-KEM family and
//! certificate signatures to the ML-DSA family. There is no permissive mode:
//! if either algorithm list cannot be applied, acceptor/connector
//! construction fails, and a handshake that somehow negotiates a group
//! outside the ML-KEM family is torn down even though the library accepted
//! it. KYBER is recognized as the legacy name for ML-KEM.

use super::TransportError;
use openssl::error::ErrorStack;
use openssl::ssl::{
    Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslRef, SslVerifyMode, SslVersion,
};
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

/// Key-exchange groups, in offered-preference order.
const PQC_GROUPS: &str = "MLKEM768:MLKEM512:MLKEM1024";

/// Certificate signature algorithms, in offered-preference order.
const PQC_SIGALGS: &str = "MLDSA65:MLDSA44:MLDSA87";

/// Server-side TLS wrapper requiring and verifying a client certificate.
#[derive(Clone)]
pub struct PqcAcceptor {
    ctx: SslContext,
}

impl PqcAcceptor {
    pub fn new(cert: &str, key: &str, ca: &str) -> Result<Self, TransportError> {
        let mut builder = pinned_pqc_context(SslMethod::tls_server())?;

        builder
            .set_certificate_chain_file(cert)
            .map_err(stack_err)?;
        builder
            .set_private_key_file(key, SslFiletype::PEM)
            .map_err(stack_err)?;
        builder.check_private_key().map_err(stack_err)?;
        builder.set_ca_file(ca).map_err(stack_err)?;

        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        builder.set_verify_depth(1);

        Ok(Self {
            ctx: builder.build(),
        })
    }

    /// Run the server side of the handshake over an accepted TCP connection.
    pub async fn accept(&self, tcp: TcpStream) -> Result<SslStream<TcpStream>, TransportError> {
        let ssl = Ssl::new(&self.ctx).map_err(stack_err)?;
        let mut stream = SslStream::new(ssl, tcp).map_err(stack_err)?;

        Pin::new(&mut stream)
            .accept()
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

        enforce_pqc_group(stream.ssl())?;
        Ok(stream)
    }
}

/// Client-side TLS wrapper verifying the server certificate.
#[derive(Clone)]
pub struct PqcConnector {
    ctx: SslContext,
    server_name: Option<String>,
}

impl PqcConnector {
    /// Build a connector. `cert`/`key` may be empty when the server does not
    /// require a client certificate; `server_name` sets the SNI.
    pub fn new(
        cert: &str,
        key: &str,
        ca: &str,
        server_name: Option<String>,
    ) -> Result<Self, TransportError> {
        let mut builder = pinned_pqc_context(SslMethod::tls_client())?;

        if !cert.is_empty() {
            builder
                .set_certificate_chain_file(cert)
                .map_err(stack_err)?;
        }
        if !key.is_empty() {
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .map_err(stack_err)?;
        }
        if !cert.is_empty() && !key.is_empty() {
            builder.check_private_key().map_err(stack_err)?;
        }
        if !ca.is_empty() {
            builder.set_ca_file(ca).map_err(stack_err)?;
        }

        builder.set_verify(SslVerifyMode::PEER);
        builder.set_verify_depth(1);

        Ok(Self {
            ctx: builder.build(),
            server_name,
        })
    }

    /// Run the client side of the handshake over a connected TCP stream.
    pub async fn connect(&self, tcp: TcpStream) -> Result<SslStream<TcpStream>, TransportError> {
        let mut ssl = Ssl::new(&self.ctx).map_err(stack_err)?;
        if let Some(name) = &self.server_name {
            ssl.set_hostname(name).map_err(stack_err)?;
        }
        let mut stream = SslStream::new(ssl, tcp).map_err(stack_err)?;

        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

        enforce_pqc_group(stream.ssl())?;
        Ok(stream)
    }
}

/// Build a TLS 1.3 context with the PQC algorithm lists applied. Failure to
/// apply either list fails construction; there is no fallback.
fn pinned_pqc_context(method: SslMethod) -> Result<SslContextBuilder, TransportError> {
    let mut builder = SslContext::builder(method).map_err(stack_err)?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1_3))
        .map_err(stack_err)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(stack_err)?;
    builder.set_groups_list(PQC_GROUPS).map_err(stack_err)?;
    builder.set_sigalgs_list(PQC_SIGALGS).map_err(stack_err)?;

    Ok(builder)
}

/// Reject a completed handshake whose negotiated key-exchange group is not in
/// the ML-KEM family.
fn enforce_pqc_group(ssl: &SslRef) -> Result<(), TransportError> {
    let group = ssl.group_name().unwrap_or_default();
    if is_ml_kem_group(group) {
        debug!(group, "post-quantum key exchange negotiated");
        Ok(())
    } else {
        Err(TransportError::HandshakeFailed(format!(
            "non-PQC algorithms were negotiated (group {group:?}), connection rejected"
        )))
    }
}

fn is_ml_kem_group(name: &str) -> bool {
    ["MLKEM", "ML-KEM", "mlkem", "ml-kem", "KYBER"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn stack_err(e: ErrorStack) -> TransportError {
    TransportError::HandshakeFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ml_kem_group_names() {
        assert!(is_ml_kem_group("MLKEM768"));
        assert!(is_ml_kem_group("ML-KEM-512"));
        assert!(is_ml_kem_group("mlkem1024"));
        assert!(is_ml_kem_group("ml-kem-768"));
        assert!(is_ml_kem_group("KYBER768"));

        assert!(!is_ml_kem_group(""));
        assert!(!is_ml_kem_group("X25519"));
        assert!(!is_ml_kem_group("secp256r1"));
        // Hybrid groups do not satisfy the pure-PQC policy
        assert!(!is_ml_kem_group("X25519MLKEM768"));
    }

    #[test]
    fn test_acceptor_requires_certificate_material() {
        let err = PqcAcceptor::new(
            "/nonexistent/server.crt",
            "/nonexistent/server.key",
            "/nonexistent/ca.crt",
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::HandshakeFailed(_)));
    }

    #[test]
    fn test_connector_rejects_missing_cert_file() {
        let err = PqcConnector::new(
            "/nonexistent/client.crt",
            "/nonexistent/client.key",
            "",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::HandshakeFailed(_)));
    }
}
