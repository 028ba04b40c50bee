//! Keeps an outbound tunnel connected

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnelgate_transport_websocket::{dial, ReconnectError, ReconnectManager};

use crate::endpoint::{EndpointOrigin, TunnelEndpoint};
use crate::hub::Hub;

/// Dials the configured peer and redials whenever the connection drops.
///
/// A dropped endpoint is never revived: each successful dial produces a new
/// endpoint with its own pending-call table.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    hub: Arc<Hub>,
    peer_url: String,
}

impl ReconnectSupervisor {
    pub fn new(hub: Arc<Hub>, peer_url: impl Into<String>) -> Self {
        Self {
            hub,
            peer_url: peer_url.into(),
        }
    }

    /// Run until `shutdown` fires or the attempt limit is reached
    pub async fn run(self, shutdown: CancellationToken) {
        let settings = self.hub.context().settings().clone();
        let check_interval = settings.reconnect.initial_backoff;
        let mut backoff = ReconnectManager::new(settings.reconnect);
        let mut current: Option<Arc<TunnelEndpoint>> = None;

        info!(peer = %self.peer_url, "Reconnect supervisor started");

        loop {
            if current.as_ref().is_some_and(|endpoint| endpoint.is_live()) {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(check_interval) => continue,
                }
            }

            if let Some(lost) = current.take() {
                warn!(
                    endpoint_id = %lost.id(),
                    peer = %self.peer_url,
                    "Tunnel connection lost, redialing"
                );
            }

            match dial(&self.peer_url, &settings.websocket).await {
                Ok(stream) => {
                    let endpoint = self
                        .hub
                        .attach(stream, EndpointOrigin::Outbound, self.peer_url.clone())
                        .await;
                    backoff.reset();
                    current = Some(endpoint);
                }
                Err(e) => {
                    warn!(peer = %self.peer_url, attempt = backoff.attempt() + 1, "Dial failed: {}", e);
                    match backoff.wait(&shutdown).await {
                        Ok(()) => {}
                        Err(ReconnectError::Cancelled) => break,
                        Err(e) => {
                            warn!(peer = %self.peer_url, "Giving up: {}", e);
                            break;
                        }
                    }
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
        }

        info!(peer = %self.peer_url, "Reconnect supervisor stopped");
    }
}
