//! End-to-end relay tests: an edge hub forwards through a real WebSocket
//! tunnel to a peer hub, which executes against an in-process upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes as AxumBytes;
use axum::extract::RawQuery;
use axum::http::StatusCode as AxumStatus;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tunnelgate_control::{
    ControlError, EndpointOrigin, Forwarder, Hub, ReconnectSupervisor, TunnelContext,
    TunnelSettings,
};
use tunnelgate_crypto::{CipherKey, Pipeline};
use tunnelgate_transport_websocket::{dial, WebSocketListener};

const KEY_HEX: &str = "904F4B1C8E2D7A3F5B6C9D0E1F2A3B4C5D6E7F8091A2B3C4D5E6F708192A3B4C";

fn context(settings: TunnelSettings) -> Arc<TunnelContext> {
    let key = CipherKey::from_hex(KEY_HEX).unwrap();
    Arc::new(TunnelContext::new(Pipeline::new(key), settings))
}

async fn base_foo(RawQuery(query): RawQuery) -> impl IntoResponse {
    (
        AxumStatus::CREATED,
        [("x-upstream", "yes")],
        format!("query={}", query.unwrap_or_default()),
    )
}

async fn echo(body: AxumBytes) -> impl IntoResponse {
    body
}

async fn redirect() -> impl IntoResponse {
    (AxumStatus::FOUND, [("location", "/elsewhere")], "moved")
}

/// 17 MiB that gzip cannot shrink below the frame limit
async fn big() -> impl IntoResponse {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let body: Vec<u8> = (0..17 * 1024 * 1024)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    body
}

async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/base/foo", get(base_foo))
        .route("/big", get(big))
        .route("/echo", any(echo))
        .route("/redirect", get(redirect));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Tunnel {
    edge: Arc<Hub>,
    peer: Arc<Hub>,
    shutdown: CancellationToken,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Edge dials the peer through a reconnect supervisor; both hubs dispatch.
async fn connected_tunnel(settings: TunnelSettings) -> Tunnel {
    let shutdown = CancellationToken::new();
    let edge = Hub::new(context(settings.clone())).unwrap();
    let peer = Hub::new(context(settings.clone())).unwrap();

    tokio::spawn(Arc::clone(&edge).run(shutdown.clone()));
    tokio::spawn(Arc::clone(&peer).run(shutdown.clone()));

    let listener = WebSocketListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(settings.websocket.clone()),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let accepting = Arc::clone(&peer);
    tokio::spawn(async move {
        while let Ok((stream, remote)) = listener.accept().await {
            accepting
                .attach(stream, EndpointOrigin::Inbound, remote.to_string())
                .await;
        }
    });

    let peer_url = format!("ws://{}{}", addr, settings.websocket.path);
    tokio::spawn(ReconnectSupervisor::new(Arc::clone(&edge), peer_url).run(shutdown.clone()));

    wait_for(|| {
        let edge = Arc::clone(&edge);
        let peer = Arc::clone(&peer);
        async move { edge.endpoint_count().await == 1 && peer.endpoint_count().await == 1 }
    })
    .await;

    Tunnel {
        edge,
        peer,
        shutdown,
    }
}

fn get_request(uri: &str) -> Request<Bytes> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("host", "edge.local")
        .body(Bytes::new())
        .unwrap()
}

#[tokio::test]
async fn test_relay_rewrites_path_and_query() {
    let upstream = start_upstream().await;
    let tunnel = connected_tunnel(TunnelSettings::default()).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let target = format!("http://{}/base?a=1", upstream);
    let response = forwarder
        .forward(&target, get_request("/foo?b=2"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-upstream"], "yes");
    assert_eq!(response.body(), "query=a=1&b=2");
}

#[tokio::test]
async fn test_relay_carries_request_body() {
    let upstream = start_upstream().await;
    let tunnel = connected_tunnel(TunnelSettings::default()).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let payload = Bytes::from(vec![b'z'; 200_000]);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/echo")
        .header("content-type", "application/octet-stream")
        .body(payload.clone())
        .unwrap();

    let response = forwarder
        .forward(&format!("http://{}", upstream), request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), &payload);
}

#[tokio::test]
async fn test_concurrent_forwards_each_get_their_own_response() {
    let upstream = start_upstream().await;
    let tunnel = connected_tunnel(TunnelSettings::default()).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let mut handles = Vec::new();
    for i in 0..20 {
        let forwarder = forwarder.clone();
        let target = format!("http://{}", upstream);
        handles.push(tokio::spawn(async move {
            let body = format!("request-{}", i);
            let request = Request::builder()
                .method(Method::POST)
                .uri("/echo")
                .body(Bytes::from(body.clone()))
                .unwrap();
            let response = forwarder.forward(&target, request).await.unwrap();
            assert_eq!(response.body(), body.as_str());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_redirect_not_followed() {
    let upstream = start_upstream().await;
    let tunnel = connected_tunnel(TunnelSettings::default()).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let response = forwarder
        .forward(&format!("http://{}", upstream), get_request("/redirect"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/elsewhere");
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let upstream = start_upstream().await;
    let tunnel = connected_tunnel(TunnelSettings::default()).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/foo")
        .body(Bytes::new())
        .unwrap();
    let response = forwarder
        .forward(&format!("http://{}/base", upstream), request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.body().is_empty());

    // Declared length of the entity a GET would have returned
    let expected = "query=".len().to_string();
    assert_eq!(response.headers()["content-length"], expected.as_str());
}

#[tokio::test]
async fn test_oversized_response_answered_with_bad_gateway() {
    let upstream = start_upstream().await;
    let settings = TunnelSettings {
        forward_timeout: Duration::from_secs(120),
        execute_timeout: Duration::from_secs(60),
        ..TunnelSettings::default()
    };
    let tunnel = connected_tunnel(settings).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let response = forwarder
        .forward(&format!("http://{}", upstream), get_request("/big"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let reason = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(reason.contains("too large"), "reason: {}", reason);
    assert!(tunnel.edge.select_endpoint().await.unwrap().is_live());
}

#[tokio::test]
async fn test_unreachable_upstream_yields_synthesized_error() {
    let tunnel = connected_tunnel(TunnelSettings::default()).await;
    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));

    let target = format!("http://{}", closed_port().await);
    let response = forwarder.forward(&target, get_request("/foo")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.body().is_empty());
}

#[tokio::test]
async fn test_no_endpoint_fails_fast() {
    let edge = Hub::new(context(TunnelSettings::default())).unwrap();
    let forwarder = Forwarder::new(edge);

    let result = forwarder
        .forward("http://upstream/base", get_request("/foo"))
        .await;
    assert!(matches!(result, Err(ControlError::EndpointNotFound)));
}

/// A peer that completes the handshake and then never answers
async fn silent_peer(
    settings: &TunnelSettings,
) -> (
    String,
    tokio::sync::oneshot::Receiver<tunnelgate_transport_websocket::ServerStream>,
) {
    let listener = WebSocketListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(settings.websocket.clone()),
    )
    .await
    .unwrap();
    let url = format!(
        "ws://{}{}",
        listener.local_addr().unwrap(),
        settings.websocket.path
    );

    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = tx.send(stream);
        }
    });
    (url, rx)
}

#[tokio::test]
async fn test_silent_peer_times_out_and_cleans_up() {
    let settings = TunnelSettings {
        forward_timeout: Duration::from_millis(300),
        ..TunnelSettings::default()
    };
    let (url, accepted) = silent_peer(&settings).await;

    let edge = Hub::new(context(settings.clone())).unwrap();
    let stream = dial(&url, &settings.websocket).await.unwrap();
    let endpoint = edge.attach(stream, EndpointOrigin::Outbound, url).await;
    let _server_side = accepted.await.unwrap();

    let forwarder = Forwarder::new(Arc::clone(&edge));
    let result = forwarder
        .forward("http://upstream/base", get_request("/foo"))
        .await;

    assert!(matches!(result, Err(ControlError::Timeout(_))));
    assert!(endpoint.pending().is_empty());
    assert!(endpoint.is_live());
}

#[tokio::test]
async fn test_peer_drop_fails_waiting_caller() {
    let settings = TunnelSettings::default();
    let (url, accepted) = silent_peer(&settings).await;

    let edge = Hub::new(context(settings.clone())).unwrap();
    let stream = dial(&url, &settings.websocket).await.unwrap();
    let endpoint = edge.attach(stream, EndpointOrigin::Outbound, url).await;
    let server_side = accepted.await.unwrap();

    let forwarder = Forwarder::new(Arc::clone(&edge));
    let waiting = tokio::spawn(async move {
        forwarder
            .forward("http://upstream/base", get_request("/foo"))
            .await
    });

    wait_for(|| {
        let endpoint = Arc::clone(&endpoint);
        async move { endpoint.pending().count() == 1 }
    })
    .await;
    drop(server_side);

    let response = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    wait_for(|| {
        let edge = Arc::clone(&edge);
        async move { edge.endpoint_count().await == 0 }
    })
    .await;
}

#[tokio::test]
async fn test_supervisor_redials_after_drop() {
    let upstream = start_upstream().await;
    let mut settings = TunnelSettings::default();
    settings.reconnect.initial_backoff = Duration::from_millis(50);
    settings.reconnect.max_backoff = Duration::from_millis(50);
    let tunnel = connected_tunnel(settings).await;

    let first = tunnel.edge.select_endpoint().await.unwrap();

    // Peer drops every connection; the edge must notice and dial again
    tunnel.peer.close_all().await;

    let edge = Arc::clone(&tunnel.edge);
    let first_id = first.id();
    wait_for(move || {
        let edge = Arc::clone(&edge);
        async move {
            match edge.select_endpoint().await {
                Some(endpoint) => endpoint.id() != first_id,
                None => false,
            }
        }
    })
    .await;
    assert!(!first.is_live());

    let forwarder = Forwarder::new(Arc::clone(&tunnel.edge));
    let response = forwarder
        .forward(&format!("http://{}/base", upstream), get_request("/foo"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_supervisor_gives_up_after_max_attempts() {
    let unreachable = closed_port().await;
    let mut settings = TunnelSettings::default();
    settings.reconnect.initial_backoff = Duration::from_millis(20);
    settings.reconnect.max_backoff = Duration::from_millis(20);
    settings.reconnect.max_attempts = Some(2);
    let edge = Hub::new(context(settings)).unwrap();

    let shutdown = CancellationToken::new();
    let supervisor = ReconnectSupervisor::new(Arc::clone(&edge), format!("ws://{}/ws", unreachable));

    // Returns on its own; shutdown is never cancelled
    tokio::time::timeout(Duration::from_secs(5), supervisor.run(shutdown.clone()))
        .await
        .expect("supervisor kept dialing past its attempt limit");
    assert!(!shutdown.is_cancelled());
    assert_eq!(edge.endpoint_count().await, 0);
}
