//! Endpoint selection policy
//!
//! Every request this node forwards travels over a single endpoint chosen by
//! the hub's selector. There is no load balancing across endpoints: the
//! default policy reproduces the "one designated tunnel" model, which caps
//! throughput at what one connection can carry.

use std::sync::Arc;

use crate::endpoint::TunnelEndpoint;

/// Picks the endpoint that carries the next forwarded request
pub trait EndpointSelector: Send + Sync {
    fn select(&self, candidates: &[Arc<TunnelEndpoint>]) -> Option<Arc<TunnelEndpoint>>;
}

/// Longest-registered live endpoint (lowest id breaks ties)
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestEndpoint;

impl EndpointSelector for OldestEndpoint {
    fn select(&self, candidates: &[Arc<TunnelEndpoint>]) -> Option<Arc<TunnelEndpoint>> {
        candidates
            .iter()
            .filter(|endpoint| endpoint.is_live())
            .min_by_key(|endpoint| (endpoint.connected_at(), endpoint.id()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointId, EndpointOrigin};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;
    use tunnelgate_transport_websocket::WebSocketConfig;

    async fn endpoint(id: u64) -> (Arc<TunnelEndpoint>, impl Sized) {
        let (a, b) = tokio::io::duplex(4096);
        let local = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let remote = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        let (ingress_tx, ingress_rx) = mpsc::channel(1);
        let endpoint = TunnelEndpoint::start(
            EndpointId(id),
            EndpointOrigin::Inbound,
            format!("peer-{}", id),
            local,
            ingress_tx,
            &WebSocketConfig::default(),
        );
        (endpoint, (remote, ingress_rx))
    }

    #[tokio::test]
    async fn test_picks_oldest_live() {
        let (first, _keep1) = endpoint(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (second, _keep2) = endpoint(2).await;

        let candidates = vec![Arc::clone(&second), Arc::clone(&first)];
        let chosen = OldestEndpoint.select(&candidates).unwrap();
        assert_eq!(chosen.id(), EndpointId(1));

        first.close();
        let chosen = OldestEndpoint.select(&candidates).unwrap();
        assert_eq!(chosen.id(), EndpointId(2));
    }

    #[tokio::test]
    async fn test_none_when_all_closed() {
        let (only, _keep) = endpoint(1).await;
        only.close();
        assert!(OldestEndpoint.select(&[only]).is_none());
        assert!(OldestEndpoint.select(&[]).is_none());
    }
}
