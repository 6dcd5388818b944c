//! qtunnel server
//!
//! Rendezvous host for the reverse tunnel: accepts control channels from
//! interior clients and bridges external TCP sessions onto them. With
//! `--tls` the control port speaks mutual-authentication TLS 1.3 restricted
//! to post-quantum algorithms.

use anyhow::{Context, Result};
use clap::Parser;
use qtunnel::config::{ServerConfig, TlsConfig};
use qtunnel::transport::PqcAcceptor;
use qtunnel::tunnel::Server;
use tracing::info;

/// qtunnel server - reverse tunnel rendezvous host
#[derive(Parser, Debug)]
#[command(name = "qtunnel-server")]
#[command(about = "Reverse tunnel server with a PQC mTLS control channel")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON; takes precedence over the other flags)
    #[arg(short, long)]
    config: Option<String>,

    /// Control channel listen address (clients dial this)
    #[arg(long, default_value = ":7000")]
    control_listen: String,

    /// Public listen address shared by all clients (empty = clients request
    /// their own port via INIT)
    #[arg(long, default_value = "")]
    public_listen: String,

    /// Enable PQC mutual TLS on the control channel
    #[arg(long)]
    tls: bool,

    /// Server certificate file path (PEM)
    #[arg(long, default_value = "certs/server.crt")]
    tls_cert: String,

    /// Server private key file path (PEM)
    #[arg(long, default_value = "certs/server.key")]
    tls_key: String,

    /// CA certificate used to verify client certificates
    #[arg(long, default_value = "certs/ca.crt")]
    tls_ca: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = match &args.config {
        Some(path) => {
            let config = ServerConfig::load(path).context("failed to load configuration")?;
            info!("loaded configuration from {}", path);
            config
        }
        None => ServerConfig {
            control_listen: args.control_listen.clone(),
            public_listen: args.public_listen.clone(),
            tls: TlsConfig {
                enabled: args.tls,
                cert: args.tls_cert.clone(),
                key: args.tls_key.clone(),
                ca: args.tls_ca.clone(),
                server_name: String::new(),
            },
        },
    };

    info!("qtunnel server v{}", qtunnel::VERSION);
    info!("control listen: {}", config.control_listen);
    if config.public_listen.is_empty() {
        info!("public port: assigned per client");
    } else {
        info!("public listen: {}", config.public_listen);
    }

    let tls = if config.tls.enabled {
        info!(
            "PQC mTLS enabled (cert: {}, key: {}, ca: {})",
            config.tls.cert, config.tls.key, config.tls.ca
        );
        Some(
            PqcAcceptor::new(&config.tls.cert, &config.tls.key, &config.tls.ca)
                .context("failed to build PQC TLS acceptor")?,
        )
    } else {
        None
    };

    let server = Server::bind(&config.control_listen, &config.public_listen, tls)
        .await
        .context("failed to start server")?;

    tokio::select! {
        result = server.run() => {
            result.context("server terminated")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
