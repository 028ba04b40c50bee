//! HTTP surface: the tunnel handshake endpoint plus a catch-all proxy

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use hyper::ext::ReasonPhrase;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tunnelgate_control::{EndpointOrigin, Forwarder, Hub, StatusText};
use tunnelgate_proto::MAX_PAYLOAD_SIZE;
use tunnelgate_router::TargetResolver;
use tunnelgate_transport_websocket::upgrade::{accept_key, complete, switching_protocols};
use tunnelgate_transport_websocket::WebSocketListener;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct AppState {
    hub: Arc<Hub>,
    forwarder: Forwarder,
    resolver: Arc<dyn TargetResolver>,
}

/// Build the node's router: `GET {ws_path}` accepts tunnel connections,
/// everything else is resolved and forwarded through the tunnel.
pub fn router(hub: Arc<Hub>, resolver: Arc<dyn TargetResolver>) -> Router {
    let ws_path = hub.context().settings().websocket.path.clone();
    let state = Arc::new(AppState {
        forwarder: Forwarder::new(Arc::clone(&hub)),
        hub,
        resolver,
    });

    Router::new()
        .route(&ws_path, get(tunnel_upgrade))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` until `shutdown` fires
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

/// Accept tunnel connections on a dedicated listener until `shutdown` fires
pub async fn accept_tunnels(listener: WebSocketListener, hub: Arc<Hub>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    hub.attach(stream, EndpointOrigin::Inbound, remote.to_string()).await;
                }
                Err(e) => {
                    warn!("Tunnel accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
    info!("Tunnel listener stopped");
}

async fn tunnel_upgrade(State(state): State<Arc<AppState>>, mut request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let key = match accept_key(request.headers()) {
        Ok(key) => key,
        Err(e) => {
            warn!(peer = %peer, "Rejected tunnel handshake: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let response = match switching_protocols::<Body>(&key) {
        Ok(response) => response,
        Err(e) => {
            warn!(peer = %peer, "Rejected tunnel handshake: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut request);
    let hub = Arc::clone(&state.hub);
    tokio::spawn(async move {
        let config = hub.context().settings().websocket.clone();
        match complete(on_upgrade, &config).await {
            Ok(stream) => {
                hub.attach(stream, EndpointOrigin::Inbound, peer).await;
            }
            Err(e) => warn!(peer = %peer, "Tunnel upgrade failed: {}", e),
        }
    });

    response
}

async fn proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some(target) = state.resolver.resolve(&parts) else {
        debug!(uri = %parts.uri, "No target for request");
        return (StatusCode::NOT_FOUND, "no route for request\n").into_response();
    };

    let body = match axum::body::to_bytes(body, MAX_PAYLOAD_SIZE as usize).await {
        Ok(body) => body,
        Err(e) => {
            warn!(uri = %parts.uri, "Failed to read request body: {}", e);
            return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response();
        }
    };

    let uri = parts.uri.clone();
    match state
        .forwarder
        .forward(&target, http::Request::from_parts(parts, body))
        .await
    {
        Ok(response) => into_axum_response(response),
        Err(e) => {
            warn!(uri = %uri, target = %target, "Forward failed: {}", e);
            (e.status_code(), format!("{}\n", e)).into_response()
        }
    }
}

fn into_axum_response(response: http::Response<Bytes>) -> Response {
    let (mut parts, body) = response.into_parts();
    if let Some(StatusText(text)) = parts.extensions.remove::<StatusText>() {
        if let Ok(reason) = ReasonPhrase::try_from(text.into_bytes()) {
            parts.extensions.insert(reason);
        }
    }
    Response::from_parts(parts, Body::from(body))
}
