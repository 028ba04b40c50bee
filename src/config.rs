//! YAML configuration file and startup validation

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tunnelgate_control::TunnelSettings;
use tunnelgate_crypto::CipherKey;
use tunnelgate_router::ProxyRules;
use tunnelgate_transport_websocket::connector::parse_peer_url;
use tunnelgate_transport_websocket::{ReconnectConfig, WebSocketConfig};

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub tunnel: TunnelSection,

    #[serde(default)]
    pub log: LogSection,

    /// Ordered path rules; the first match wins
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// HTTP and tunnel listener address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_addr: Option<String>,

    /// Peer to dial; presence makes this node the initiator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,

    /// Extra socket that accepts only tunnel connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_addr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSection {
    /// Hex-encoded AES key (16, 24 or 32 bytes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub ws_path: String,
    pub forward_timeout_secs: u64,
    pub execute_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub idle_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub reconnect_interval_ms: u64,
    pub reconnect_max_interval_ms: u64,
    /// Consecutive failed dials before the supervisor gives up; unset retries forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_attempts: Option<usize>,
    pub max_in_flight: usize,
    pub ingress_capacity: usize,
    pub outbound_capacity: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            key: None,
            ws_path: "/ws".to_string(),
            forward_timeout_secs: 30,
            execute_timeout_secs: 5,
            keepalive_secs: 54,
            idle_timeout_secs: 60,
            write_timeout_secs: 10,
            reconnect_interval_ms: 1000,
            reconnect_max_interval_ms: 1000,
            reconnect_max_attempts: None,
            max_in_flight: 256,
            ingress_capacity: 1024,
            outbound_capacity: 256,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: String,

    /// Directory for a daily-rotated log file, in addition to stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyEntry {
    /// Regular expression matched against the request path
    pub path: String,
    /// Absolute URL the matching requests are relayed to
    pub target: String,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub self_addr: Option<String>,
    pub peer_addr: Option<String>,
    pub tunnel_addr: Option<String>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

/// Fully validated node configuration
#[derive(Debug)]
pub struct NodeConfig {
    pub self_addr: SocketAddr,
    pub peer_url: Option<String>,
    pub tunnel_addr: Option<SocketAddr>,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub key: CipherKey,
    pub settings: TunnelSettings,
    pub rules: ProxyRules,
}

impl FileConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        // An empty file deserializes to YAML null
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Merge CLI overrides and validate everything needed to start a node
    pub fn resolve(self, overrides: Overrides) -> Result<NodeConfig> {
        let self_addr = overrides
            .self_addr
            .or(self.server.self_addr)
            .ok_or_else(|| anyhow::anyhow!("server.self_addr is required (or --self-addr)"))?;
        let self_addr: SocketAddr = self_addr
            .parse()
            .with_context(|| format!("Invalid self address: {}", self_addr))?;

        let peer_url = overrides
            .peer_addr
            .or(self.server.peer_addr)
            .filter(|addr| !addr.trim().is_empty());
        if let Some(url) = &peer_url {
            parse_peer_url(url).with_context(|| format!("Invalid peer address: {}", url))?;
        }

        let tunnel_addr = overrides
            .tunnel_addr
            .or(self.server.tunnel_addr)
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid tunnel address: {}", addr))
            })
            .transpose()?;

        let log_level = overrides.log_level.unwrap_or(self.log.level);
        let log_dir = overrides
            .log_dir
            .or(self.log.dir)
            .filter(|dir| !dir.as_os_str().is_empty());

        let tunnel = self.tunnel;
        let key = match &tunnel.key {
            Some(hex_key) => CipherKey::from_hex(hex_key).context("Invalid tunnel.key")?,
            None => bail!("tunnel.key is required"),
        };
        let settings = tunnel.settings()?;

        let rules = ProxyRules::from_pairs(
            self.proxies
                .into_iter()
                .map(|entry| (entry.path, entry.target)),
        )
        .context("Invalid proxies entry")?;

        Ok(NodeConfig {
            self_addr,
            peer_url,
            tunnel_addr,
            log_level,
            log_dir,
            key,
            settings,
            rules,
        })
    }
}

impl TunnelSection {
    fn settings(&self) -> Result<TunnelSettings> {
        if self.forward_timeout_secs == 0 || self.execute_timeout_secs == 0 {
            bail!("tunnel timeouts must be greater than zero");
        }
        if self.max_in_flight == 0 || self.ingress_capacity == 0 {
            bail!("tunnel.max_in_flight and tunnel.ingress_capacity must be greater than zero");
        }
        if self.reconnect_interval_ms == 0
            || self.reconnect_max_interval_ms < self.reconnect_interval_ms
        {
            bail!(
                "tunnel.reconnect_max_interval_ms ({}) must be at least reconnect_interval_ms ({}), which must be non-zero",
                self.reconnect_max_interval_ms,
                self.reconnect_interval_ms
            );
        }
        if self.reconnect_max_attempts == Some(0) {
            bail!("tunnel.reconnect_max_attempts must be greater than zero when set");
        }

        let websocket = WebSocketConfig {
            outbound_capacity: self.outbound_capacity,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            ..WebSocketConfig::default()
        }
        .with_path(&self.ws_path)
        .with_keep_alive(
            Duration::from_secs(self.keepalive_secs),
            Duration::from_secs(self.idle_timeout_secs),
        );
        websocket.validate().context("Invalid tunnel settings")?;

        Ok(TunnelSettings {
            forward_timeout: Duration::from_secs(self.forward_timeout_secs),
            execute_timeout: Duration::from_secs(self.execute_timeout_secs),
            max_in_flight: self.max_in_flight,
            ingress_capacity: self.ingress_capacity,
            reconnect: ReconnectConfig {
                max_attempts: self.reconnect_max_attempts,
                ..ReconnectConfig::exponential(
                    Duration::from_millis(self.reconnect_interval_ms),
                    Duration::from_millis(self.reconnect_max_interval_ms),
                )
            },
            websocket,
        })
    }
}
