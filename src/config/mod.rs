//! JSON configuration for the server and client binaries
//!
//! When a config file is given on the command line it takes precedence over
//! the individual flags.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// PQC mTLS settings shared by both endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Enable PQC mutual TLS on the control channel
    #[serde(default)]
    pub enabled: bool,
    /// Certificate file path (PEM)
    #[serde(default)]
    pub cert: String,
    /// Private key file path (PEM)
    #[serde(default)]
    pub key: String,
    /// CA certificate used to verify the peer
    #[serde(default)]
    pub ca: String,
    /// TLS SNI server name (client only; empty = use the server address)
    #[serde(default)]
    pub server_name: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control channel listen address (clients dial this)
    #[serde(default = "default_control_listen")]
    pub control_listen: String,
    /// Public listen address shared by all clients; empty = each client
    /// requests its own port via INIT
    #[serde(default)]
    pub public_listen: String,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_control_listen() -> String {
    ":7000".to_string()
}

impl ServerConfig {
    /// Load server configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {e}")))?;

        let mut config: ServerConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))?;

        if config.control_listen.is_empty() {
            config.control_listen = default_control_listen();
        }

        Ok(config)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server control address, e.g. `1.2.3.4:7000`
    pub server: String,
    /// Local service address to map, e.g. `127.0.0.1:80`
    pub local: String,
    /// Port the server should expose (0 = server-chosen / global listener)
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl ClientConfig {
    /// Load client configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {e}")))?;

        let config: ClientConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))?;

        if config.server.is_empty() {
            return Err(crate::Error::Config(
                "\"server\" field is required".to_string(),
            ));
        }
        if config.local.is_empty() {
            return Err(crate::Error::Config(
                "\"local\" field is required".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Normalize a `:port` listen shorthand into a bindable address.
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("qtunnel-config-test-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_server_config_full() {
        let path = write_temp(
            "server-full.json",
            r#"{
                "control_listen": ":7000",
                "public_listen": ":8080",
                "tls": {
                    "enabled": true,
                    "cert": "certs/server.crt",
                    "key": "certs/server.key",
                    "ca": "certs/ca.crt"
                }
            }"#,
        );

        let config = ServerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.control_listen, ":7000");
        assert_eq!(config.public_listen, ":8080");
        assert!(config.tls.enabled);
        assert_eq!(config.tls.cert, "certs/server.crt");
    }

    #[test]
    fn test_server_config_defaults() {
        let path = write_temp("server-min.json", "{}");
        let config = ServerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.control_listen, ":7000");
        assert!(config.public_listen.is_empty());
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_client_config_requires_server_and_local() {
        let path = write_temp("client-missing.json", r#"{"server": "1.2.3.4:7000"}"#);
        assert!(ClientConfig::load(&path).is_err());
        std::fs::remove_file(&path).ok();

        let path = write_temp(
            "client-ok.json",
            r#"{"server": "1.2.3.4:7000", "local": "127.0.0.1:80", "remote_port": 18080}"#,
        );
        let config = ClientConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.remote_port, 18080);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let path = write_temp("broken.json", "{not json");
        let err = ServerConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":7000"), "0.0.0.0:7000");
        assert_eq!(normalize_listen_addr("127.0.0.1:7000"), "127.0.0.1:7000");
    }
}
