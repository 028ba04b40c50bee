//! Standalone tunnel listener

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::error::{TransportError, TransportResult};

pub type ServerStream = WebSocketStream<TcpStream>;

/// Accepts tunnel connections on a dedicated socket.
///
/// Only handshakes addressed to the configured path are accepted; anything
/// else is answered with 404 and skipped.
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("path", &self.config.path)
            .finish()
    }
}

impl WebSocketListener {
    pub async fn bind(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tcp_listener = TcpListener::bind(bind_addr).await?;
        let local_addr = tcp_listener.local_addr()?;
        info!("WebSocket listener bound to ws://{}{}", local_addr, config.path);

        Ok(Self {
            tcp_listener,
            config,
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    /// Wait for the next successful handshake.
    ///
    /// Failed handshakes are logged and skipped; only a failure of the
    /// listening socket itself is returned.
    pub async fn accept(&self) -> TransportResult<(ServerStream, SocketAddr)> {
        loop {
            let (tcp_stream, remote_addr) = self
                .tcp_listener
                .accept()
                .await
                .map_err(TransportError::Io)?;

            debug!("Incoming TCP connection from {}", remote_addr);

            let config = Arc::clone(&self.config);
            let callback = move |req: &Request, response: Response| {
                if config.matches_path(req.uri().path()) {
                    Ok(response)
                } else {
                    let mut rejection = ErrorResponse::new(None);
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            };

            let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(
                tcp_stream,
                callback,
                Some(self.config.protocol_config()),
            )
            .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
                    continue;
                }
            };

            info!("WebSocket connection established from {}", remote_addr);
            return Ok((ws_stream, remote_addr));
        }
    }
}
