//! Shared state handed to every tunnel component

use std::time::Duration;

use tunnelgate_crypto::Pipeline;
use tunnelgate_proto::SequenceGenerator;
use tunnelgate_transport_websocket::{ReconnectConfig, WebSocketConfig};

/// Tunables for one tunnel node
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// How long a forwarded request waits for the peer's response
    pub forward_timeout: Duration,
    /// Upper bound on the peer-side upstream HTTP call
    pub execute_timeout: Duration,
    /// Frames handled concurrently by the dispatcher
    pub max_in_flight: usize,
    /// Capacity of the shared ingress queue between readers and dispatcher
    pub ingress_capacity: usize,
    pub reconnect: ReconnectConfig,
    pub websocket: WebSocketConfig,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(30),
            execute_timeout: Duration::from_secs(5),
            max_in_flight: 256,
            ingress_capacity: 1024,
            reconnect: ReconnectConfig::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

/// Key material, sequence counter and settings for one node.
///
/// Built once at startup and shared behind an `Arc`. Independent contexts
/// give independent nodes, which is how the tests run two peers in one
/// process.
#[derive(Debug)]
pub struct TunnelContext {
    pipeline: Pipeline,
    sequences: SequenceGenerator,
    settings: TunnelSettings,
}

impl TunnelContext {
    pub fn new(pipeline: Pipeline, settings: TunnelSettings) -> Self {
        Self {
            pipeline,
            sequences: SequenceGenerator::new(),
            settings,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn next_sequence(&self) -> u32 {
        self.sequences.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelgate_crypto::CipherKey;

    #[test]
    fn test_contexts_have_independent_sequences() {
        let key = CipherKey::from_bytes(&[7u8; 32]).unwrap();
        let a = TunnelContext::new(Pipeline::new(key.clone()), TunnelSettings::default());
        let b = TunnelContext::new(Pipeline::new(key), TunnelSettings::default());

        assert_eq!(a.next_sequence(), 1);
        assert_eq!(a.next_sequence(), 2);
        assert_eq!(b.next_sequence(), 1);
    }

    #[test]
    fn test_default_settings() {
        let settings = TunnelSettings::default();
        assert_eq!(settings.forward_timeout, Duration::from_secs(30));
        assert_eq!(settings.execute_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_in_flight, 256);
        assert_eq!(settings.ingress_capacity, 1024);
        assert_eq!(settings.reconnect.initial_backoff, Duration::from_secs(1));
    }
}
