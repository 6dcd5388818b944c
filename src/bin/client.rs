//! qtunnel client
//!
//! Interior agent for the reverse tunnel: dials the rendezvous server,
//! announces which local service to map, and bridges every announced stream
//! to it. Reconnects with a fixed delay whenever the control channel drops.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use qtunnel::config::{ClientConfig, TlsConfig};
use qtunnel::transport::PqcConnector;
use qtunnel::tunnel::Client;
use tracing::info;

/// qtunnel client - reverse tunnel interior agent
#[derive(Parser, Debug)]
#[command(name = "qtunnel-client")]
#[command(about = "Reverse tunnel client with a PQC mTLS control channel")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON; takes precedence over the other flags)
    #[arg(short, long)]
    config: Option<String>,

    /// Server control address, e.g. 1.2.3.4:7000 (required unless --config)
    #[arg(long)]
    server: Option<String>,

    /// Local service address to map, e.g. 127.0.0.1:80 (required unless --config)
    #[arg(long)]
    local: Option<String>,

    /// Public port the server should expose (0 = server-chosen / global listener)
    #[arg(long, default_value_t = 0)]
    remote_port: u16,

    /// Enable PQC mutual TLS on the control channel
    #[arg(long)]
    tls: bool,

    /// Client certificate file path (PEM)
    #[arg(long, default_value = "certs/client.crt")]
    tls_cert: String,

    /// Client private key file path (PEM)
    #[arg(long, default_value = "certs/client.key")]
    tls_key: String,

    /// CA certificate used to verify the server certificate
    #[arg(long, default_value = "certs/ca.crt")]
    tls_ca: String,

    /// TLS SNI server name (empty = use the server address)
    #[arg(long, default_value = "")]
    tls_server_name: String,

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
            let config = ClientConfig::load(path).context("failed to load configuration")?;
            info!("loaded configuration from {}", path);
            config
        }
        None => {
            let server = args
                .server
                .clone()
                .ok_or_else(|| anyhow!("--server is required (or use --config)"))?;
            let local = args
                .local
                .clone()
                .ok_or_else(|| anyhow!("--local is required (or use --config)"))?;
            ClientConfig {
                server,
                local,
                remote_port: args.remote_port,
                tls: TlsConfig {
                    enabled: args.tls,
                    cert: args.tls_cert.clone(),
                    key: args.tls_key.clone(),
                    ca: args.tls_ca.clone(),
                    server_name: args.tls_server_name.clone(),
                },
            }
        }
    };

    info!("qtunnel client v{}", qtunnel::VERSION);
    if config.remote_port > 0 {
        info!(
            "mapping: {}:{} -> {}",
            config.server, config.remote_port, config.local
        );
    } else {
        info!(
            "mapping: {} -> {} (public port chosen by server)",
            config.server, config.local
        );
    }

    let mut client = Client::new(&config.server, &config.local, config.remote_port);
    if config.tls.enabled {
        info!(
            "PQC mTLS enabled (cert: {}, key: {}, ca: {})",
            config.tls.cert, config.tls.key, config.tls.ca
        );
        let server_name = if config.tls.server_name.is_empty() {
            config.server.clone()
        } else {
            config.tls.server_name.clone()
        };
        let connector = PqcConnector::new(
            &config.tls.cert,
            &config.tls.key,
            &config.tls.ca,
            Some(server_name),
        )
        .context("failed to build PQC TLS connector")?;
        client = client.with_tls(connector);
    }

    tokio::select! {
        result = client.run() => {
            result.context("client terminated")?;
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
