//! Server-side handshake for tunnel connections arriving through an HTTP server
//!
//! The HTTP server validates the request with [`accept_key`], answers with
//! [`switching_protocols`], and hands the connection's `OnUpgrade` future to
//! [`complete`] once the response is on its way.

use http::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Response, StatusCode};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::config::WebSocketConfig;
use crate::error::{TransportError, TransportResult};

pub type UpgradedStream = WebSocketStream<TokioIo<Upgraded>>;

fn header_has_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Validate a WebSocket upgrade request and compute its `Sec-WebSocket-Accept`
pub fn accept_key(headers: &HeaderMap) -> TransportResult<String> {
    if !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(TransportError::Upgrade(
            "missing 'Connection: upgrade'".to_string(),
        ));
    }
    if !header_has_token(headers, UPGRADE, "websocket") {
        return Err(TransportError::Upgrade(
            "missing 'Upgrade: websocket'".to_string(),
        ));
    }
    match headers.get(SEC_WEBSOCKET_VERSION) {
        Some(version) if version.as_bytes() == b"13" => {}
        _ => {
            return Err(TransportError::Upgrade(
                "unsupported Sec-WebSocket-Version (expected 13)".to_string(),
            ))
        }
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| TransportError::Upgrade("missing Sec-WebSocket-Key".to_string()))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// The `101 Switching Protocols` response that completes the handshake
pub fn switching_protocols<B: Default>(accept_key: &str) -> TransportResult<Response<B>> {
    let accept = HeaderValue::from_str(accept_key)
        .map_err(|e| TransportError::Upgrade(format!("invalid accept key: {}", e)))?;

    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);

    Ok(response)
}

/// Wait for the HTTP server to hand over the connection and wrap it as a
/// server-role WebSocket.
pub async fn complete(
    on_upgrade: OnUpgrade,
    config: &WebSocketConfig,
) -> TransportResult<UpgradedStream> {
    let upgraded = on_upgrade
        .await
        .map_err(|e| TransportError::Upgrade(e.to_string()))?;

    debug!("HTTP connection upgraded to WebSocket");

    Ok(WebSocketStream::from_raw_socket(
        TokioIo::new(upgraded),
        Role::Server,
        Some(config.protocol_config()),
    )
    .await)
}
