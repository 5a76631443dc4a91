//! Configuration handling for the netkit binary.
//!
//! Settings come from a YAML file (defaults when it is missing or malformed),
//! then `NETKIT_*` environment variables, then command line flags.

use anyhow::Result;
use netkit_session::{ManagerConfig, RelayMode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Accept connections or dial one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Server,
    Client,
}

/// Socket flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
}

/// How TCP payloads are framed (ignored for WebSocket)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// UTF-8 text, one message per line
    #[default]
    Lines,
    /// UTF-8 text, NUL terminated
    Null,
    /// Raw bytes, one message per line
    Bytes,
    /// Brace-balanced JSON objects
    Json,
    /// Well-formed XML documents
    Xml,
}

/// Netkit binary configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetkitConfig {
    /// Manager name used in logs and reports
    pub name: String,
    pub role: Role,
    pub transport: Transport,
    pub framing: Framing,
    /// Custom text delimiter replacing the framing's default
    pub delimiter: Option<String>,
    /// Listen address (server) or remote address (client), `host:port`
    pub address: String,
    /// WebSocket request path (client)
    pub path: String,
    pub heartbeat_ms: u64,
    pub retention_secs: u64,
    pub connect_timeout_ms: u64,
    pub relay: RelayMode,
    /// Connection-level echo of every frame
    pub echo: bool,
}

impl Default for NetkitConfig {
    fn default() -> Self {
        Self {
            name: "netkit".to_string(),
            role: Role::Server,
            transport: Transport::Tcp,
            framing: Framing::Lines,
            delimiter: None,
            address: "127.0.0.1:7000".to_string(),
            path: "/".to_string(),
            heartbeat_ms: 1000,
            retention_secs: 30,
            connect_timeout_ms: 5000,
            relay: RelayMode::None,
            echo: false,
        }
    }
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    netkit: Option<NetkitConfig>,
}

fn parse_value<T: DeserializeOwned>(value: &str) -> Option<T> {
    serde_yaml::from_str(value).ok()
}

impl NetkitConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.netkit.unwrap_or_default()
                }
                Err(err) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", path, err);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `NETKIT_*` environment variables
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("NETKIT_NAME") {
            self.name = name;
        }
        if let Some(role) = lookup("NETKIT_ROLE").and_then(|v| parse_value(&v)) {
            self.role = role;
            info!("Role overridden by environment: {:?}", role);
        }
        if let Some(transport) = lookup("NETKIT_TRANSPORT").and_then(|v| parse_value(&v)) {
            self.transport = transport;
            info!("Transport overridden by environment: {:?}", transport);
        }
        if let Some(framing) = lookup("NETKIT_FRAMING").and_then(|v| parse_value(&v)) {
            self.framing = framing;
        }
        if let Some(delimiter) = lookup("NETKIT_DELIMITER") {
            self.delimiter = Some(delimiter);
        }
        if let Some(address) = lookup("NETKIT_ADDRESS") {
            info!("Address overridden by environment: {}", address);
            self.address = address;
        }
        if let Some(path) = lookup("NETKIT_PATH") {
            self.path = path;
        }
        if let Some(ms) = lookup("NETKIT_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            self.heartbeat_ms = ms;
        }
        if let Some(secs) = lookup("NETKIT_RETENTION_SECS").and_then(|v| v.parse().ok()) {
            self.retention_secs = secs;
        }
        if let Some(relay) = lookup("NETKIT_RELAY").and_then(|v| parse_value(&v)) {
            self.relay = relay;
        }
        if let Some(echo) = lookup("NETKIT_ECHO") {
            self.echo = echo.eq_ignore_ascii_case("true") || echo == "1";
        }
    }

    /// Manager settings derived from this configuration
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            name: self.name.clone(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            retention: Duration::from_secs(self.retention_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            relay: self.relay,
            echo: self.echo,
            ..ManagerConfig::default()
        }
    }
}

/// Parse a relay mode flag
pub fn parse_relay(value: &str) -> std::result::Result<RelayMode, String> {
    parse_value(value).ok_or_else(|| format!("invalid relay mode: {value} (none, echo, broadcast)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NetkitConfig::default();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.address, "127.0.0.1:7000");
        assert_eq!(config.manager_config().heartbeat_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
netkit:
  name: relay
  role: client
  transport: ws
  address: 10.0.0.5:9000
  path: /chat
  heartbeat_ms: 250
  relay: broadcast
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NetkitConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.name, "relay");
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.transport, Transport::Ws);
        assert_eq!(config.path, "/chat");
        assert_eq!(config.relay, RelayMode::Broadcast);
        assert_eq!(config.framing, Framing::Lines);
        assert_eq!(config.retention_secs, 30);
        assert_eq!(
            config.manager_config().heartbeat_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"netkit: [not, a, map").unwrap();

        let mut config = NetkitConfig::load_from_file(temp_file.path()).unwrap();
        config.apply_overrides(|_| None);
        assert_eq!(config.name, NetkitConfig::default().name);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NETKIT_ROLE", "client"),
            ("NETKIT_FRAMING", "json"),
            ("NETKIT_HEARTBEAT_MS", "100"),
            ("NETKIT_RELAY", "echo"),
            ("NETKIT_ECHO", "true"),
            ("NETKIT_TRANSPORT", "carrier-pigeon"),
        ]
        .into_iter()
        .collect();

        let mut config = NetkitConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.role, Role::Client);
        assert_eq!(config.framing, Framing::Json);
        assert_eq!(config.heartbeat_ms, 100);
        assert_eq!(config.relay, RelayMode::Echo);
        assert!(config.echo);
        assert_eq!(config.transport, Transport::Tcp, "invalid values are ignored");
    }

    #[test]
    fn test_parse_relay() {
        assert_eq!(parse_relay("broadcast"), Ok(RelayMode::Broadcast));
        assert!(parse_relay("everyone").is_err());
    }
}
