//! Outbound tunnel connections

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::config::WebSocketConfig;
use crate::error::{TransportError, TransportResult};

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Check that `peer_url` is something [`dial`] can connect to
pub fn parse_peer_url(peer_url: &str) -> TransportResult<Url> {
    let url = Url::parse(peer_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    if url.scheme() != "ws" {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme '{}' (expected ws)",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(TransportError::InvalidUrl(format!(
            "missing host in {}",
            peer_url
        )));
    }

    Ok(url)
}

/// Open a tunnel connection to `peer_url`.
///
/// TCP connect and the WebSocket handshake together are bounded by
/// `config.connect_timeout`.
pub async fn dial(peer_url: &str, config: &WebSocketConfig) -> TransportResult<ClientStream> {
    let url = parse_peer_url(peer_url)?;

    debug!(peer = %url, "Dialing tunnel peer");

    let handshake = tokio_tungstenite::connect_async_with_config(
        url.as_str(),
        Some(config.protocol_config()),
        true,
    );

    let (stream, response) = tokio::time::timeout(config.connect_timeout, handshake)
        .await
        .map_err(|_| {
            TransportError::Connect(format!(
                "timed out after {:?} connecting to {}",
                config.connect_timeout, url
            ))
        })?
        .map_err(map_handshake_error)?;

    info!(
        peer = %url,
        status = %response.status(),
        "Tunnel connection established"
    );

    Ok(stream)
}

fn map_handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(e) => TransportError::Connect(e.to_string()),
        other => TransportError::Handshake(other.to_string()),
    }
}
