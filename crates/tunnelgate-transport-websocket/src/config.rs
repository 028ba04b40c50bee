//! WebSocket transport configuration

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;

use crate::error::{TransportError, TransportResult};

/// Largest single message accepted from a peer. One message carries one packet.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024 + 64;

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Path the tunnel handshake is served on
    pub path: String,
    /// Interval between keepalive pings sent by the writer
    pub keep_alive_interval: Duration,
    /// Reader gives up after this long without any inbound message
    pub max_idle_timeout: Duration,
    /// Upper bound on a single message write
    pub write_timeout: Duration,
    /// Upper bound on TCP connect plus handshake when dialing
    pub connect_timeout: Duration,
    /// Capacity of the per-endpoint outbound queue
    pub outbound_capacity: usize,
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            keep_alive_interval: Duration::from_secs(54),
            max_idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 256,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl WebSocketConfig {
    /// Set WebSocket path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Set keepalive interval and idle timeout together
    pub fn with_keep_alive(mut self, interval: Duration, idle_timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.max_idle_timeout = idle_timeout;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(TransportError::Configuration(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.keep_alive_interval.is_zero() || self.max_idle_timeout.is_zero() {
            return Err(TransportError::Configuration(
                "keepalive interval and idle timeout must be non-zero".to_string(),
            ));
        }
        // A ping must go out before the peer's reader declares us idle
        if self.keep_alive_interval >= self.max_idle_timeout {
            return Err(TransportError::Configuration(format!(
                "keepalive interval ({:?}) must be shorter than idle timeout ({:?})",
                self.keep_alive_interval, self.max_idle_timeout
            )));
        }
        if self.write_timeout.is_zero() {
            return Err(TransportError::Configuration(
                "write timeout must be non-zero".to_string(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(TransportError::Configuration(
                "outbound queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `path` addresses the tunnel handshake (trailing slash tolerated)
    pub fn matches_path(&self, path: &str) -> bool {
        path == self.path || path.strip_suffix('/') == Some(self.path.as_str())
    }

    /// Protocol limits handed to tungstenite
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_message_size),
            ..Default::default()
        }
    }
}
