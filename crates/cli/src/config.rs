use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

const DEFAULT_PORT: u16 = 6885;
const DEFAULT_MAX_CLIENTS: u16 = 32;
const DEFAULT_SUBNET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    port: Option<u16>,
    subnet: Option<String>,
    max_clients: Option<u16>,
    tap_name: Option<String>,
    server: Option<String>,
}

/// Fully resolved configuration for `exu server`, after merging an optional
/// TOML file with CLI flag overrides. Missing fields fall back to the
/// defaults documented for the tunnel's listening port and subnet.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub subnet_base: Ipv4Addr,
    pub max_clients: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            subnet_base: DEFAULT_SUBNET,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// Fully resolved configuration for `exu connect`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub tap_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{DEFAULT_PORT}"),
            tap_name: "tap0".to_string(),
        }
    }
}

fn load_raw(path: Option<&Path>) -> anyhow::Result<RawConfig> {
    let Some(path) = path else {
        return Ok(RawConfig::default());
    };
    if !path.exists() {
        return Ok(RawConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

pub fn load_server_config(
    path: Option<&Path>,
    port_override: Option<u16>,
    subnet_override: Option<Ipv4Addr>,
    max_clients_override: Option<u16>,
) -> anyhow::Result<ServerConfig> {
    let raw = load_raw(path)?;
    let mut config = ServerConfig::default();
    if let Some(port) = raw.port {
        config.port = port;
    }
    if let Some(subnet) = raw.subnet.as_deref() {
        config.subnet_base = subnet.parse()?;
    }
    if let Some(max_clients) = raw.max_clients {
        config.max_clients = max_clients;
    }
    if let Some(port) = port_override {
        config.port = port;
    }
    if let Some(subnet) = subnet_override {
        config.subnet_base = subnet;
    }
    if let Some(max_clients) = max_clients_override {
        config.max_clients = max_clients;
    }
    Ok(config)
}

pub fn load_client_config(
    path: Option<&Path>,
    server_override: Option<String>,
    tap_name_override: Option<String>,
) -> anyhow::Result<ClientConfig> {
    let raw = load_raw(path)?;
    let mut config = ClientConfig::default();
    if let Some(server) = raw.server {
        config.server = server;
    }
    if let Some(tap_name) = raw.tap_name {
        config.tap_name = tap_name;
    }
    if let Some(server) = server_override {
        config.server = server;
    }
    if let Some(tap_name) = tap_name_override {
        config.tap_name = tap_name;
    }
    Ok(config)
}
