//! Hub: endpoint registry plus the ingress dispatcher
//!
//! All endpoints of a node feed one bounded ingress queue. The dispatcher
//! decodes each message and handles it on its own task, with at most
//! `max_in_flight` handlers running at once. When every slot is taken the
//! dispatcher stops pulling from the queue; once the queue fills, endpoint
//! readers block and stop reading from their sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream};
use http::{Response, StatusCode};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnelgate_crypto::{Pipeline, PipelineError};
use tunnelgate_proto::{FramingError, Packet, PacketHeader, PacketType, MAX_PAYLOAD_SIZE};
use tunnelgate_transport_websocket::{Message, WsError};

use crate::context::TunnelContext;
use crate::endpoint::{EndpointId, EndpointOrigin, Ingress, TunnelEndpoint};
use crate::error::ControlError;
use crate::http_wire::{decode_response, encode_response, error_response};
use crate::relay::RelayExecutor;
use crate::selector::{EndpointSelector, OldestEndpoint};

/// Registry of live tunnel endpoints and dispatcher of their traffic
pub struct Hub {
    context: Arc<TunnelContext>,
    endpoints: RwLock<HashMap<EndpointId, Arc<TunnelEndpoint>>>,
    next_id: AtomicU64,
    ingress_tx: mpsc::Sender<Ingress>,
    ingress_rx: Mutex<Option<mpsc::Receiver<Ingress>>>,
    selector: Box<dyn EndpointSelector>,
    relay: RelayExecutor,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl Hub {
    pub fn new(context: Arc<TunnelContext>) -> Result<Arc<Self>, ControlError> {
        Self::with_selector(context, OldestEndpoint)
    }

    pub fn with_selector<S>(context: Arc<TunnelContext>, selector: S) -> Result<Arc<Self>, ControlError>
    where
        S: EndpointSelector + 'static,
    {
        let settings = context.settings();
        let relay = RelayExecutor::new(settings.execute_timeout)?;
        let (ingress_tx, ingress_rx) = mpsc::channel(settings.ingress_capacity.max(1));

        Ok(Arc::new(Self {
            context,
            endpoints: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            selector: Box::new(selector),
            relay,
        }))
    }

    pub fn context(&self) -> &Arc<TunnelContext> {
        &self.context
    }

    /// Wrap an established connection in an endpoint, register it and
    /// unregister it again once the connection drops.
    pub async fn attach<S>(
        self: &Arc<Self>,
        stream: S,
        origin: EndpointOrigin,
        peer: impl Into<String>,
    ) -> Arc<TunnelEndpoint>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let id = EndpointId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let endpoint = TunnelEndpoint::start(
            id,
            origin,
            peer.into(),
            stream,
            self.ingress_tx.clone(),
            &self.context.settings().websocket,
        );

        self.register(Arc::clone(&endpoint)).await;

        let hub = Arc::clone(self);
        let watched = Arc::clone(&endpoint);
        tokio::spawn(async move {
            watched.torn_down().await;
            hub.unregister(watched.id()).await;
        });

        endpoint
    }

    pub async fn register(&self, endpoint: Arc<TunnelEndpoint>) {
        let id = endpoint.id();
        let count = {
            let mut endpoints = self.endpoints.write().await;
            endpoints.insert(id, endpoint);
            endpoints.len()
        };
        debug!(endpoint_id = %id, registered = count, "Endpoint registered");
    }

    /// Remove an endpoint from the registry and close it
    pub async fn unregister(&self, id: EndpointId) -> Option<Arc<TunnelEndpoint>> {
        let removed = self.endpoints.write().await.remove(&id);
        if let Some(endpoint) = &removed {
            endpoint.close();
            debug!(endpoint_id = %id, "Endpoint unregistered");
        }
        removed
    }

    pub async fn get(&self, id: EndpointId) -> Option<Arc<TunnelEndpoint>> {
        self.endpoints.read().await.get(&id).cloned()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Endpoint that should carry the next forwarded request
    pub async fn select_endpoint(&self) -> Option<Arc<TunnelEndpoint>> {
        let candidates: Vec<_> = self.endpoints.read().await.values().cloned().collect();
        self.selector.select(&candidates)
    }

    /// Close and unregister every endpoint
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.endpoints.write().await.drain().collect();
        for (_, endpoint) in drained {
            endpoint.close();
        }
    }

    fn take_ingress(&self) -> Option<mpsc::Receiver<Ingress>> {
        self.ingress_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Dispatch loop. Runs until `shutdown` fires; only one may run per hub.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut ingress) = self.take_ingress() else {
            warn!("Dispatcher already running for this hub");
            return;
        };

        let slots = Arc::new(Semaphore::new(self.context.settings().max_in_flight.max(1)));
        info!(
            max_in_flight = self.context.settings().max_in_flight,
            "Dispatcher started"
        );

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = ingress.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let packet = match Packet::parse(item.data) {
                Ok(packet) => packet,
                Err(FramingError::UnknownType(kind)) => {
                    error!(
                        endpoint_id = %item.endpoint.id(),
                        packet_type = kind,
                        "Unknown packet type, dropping"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(endpoint_id = %item.endpoint.id(), "Dropping malformed packet: {}", e);
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let hub = Arc::clone(&self);
            let endpoint = item.endpoint;
            tokio::spawn(async move {
                hub.handle_ingress(&endpoint, packet).await;
                drop(permit);
            });
        }

        debug!("Dispatcher stopped");
    }

    /// Act on one decoded packet from `endpoint`
    pub async fn handle_ingress(&self, endpoint: &Arc<TunnelEndpoint>, packet: Packet) {
        match packet.packet_type() {
            PacketType::Request => self.handle_request(endpoint, packet).await,
            PacketType::Response => self.handle_response(endpoint, packet),
            PacketType::Notice => {
                warn!(
                    endpoint_id = %endpoint.id(),
                    seq = packet.sequence(),
                    "Notice packets are not processed"
                );
            }
        }
    }

    async fn handle_request(&self, endpoint: &Arc<TunnelEndpoint>, packet: Packet) {
        let id = endpoint.id();
        let seq = packet.sequence();
        let pipeline = self.context.pipeline();

        let raw_request = match pipeline.open(&packet.payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(endpoint_id = %id, seq, "Dropping request packet: {}", e);
                return;
            }
        };

        let response = self.relay.execute(&raw_request).await;

        let reply = match reply_packet(
            pipeline,
            &packet.header,
            &response,
            MAX_PAYLOAD_SIZE as usize,
        ) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(endpoint_id = %id, seq, "Could not seal error response: {}", e);
                return;
            }
        };

        if let Err(e) = endpoint.send_frame(reply, None).await {
            warn!(endpoint_id = %id, seq, "Could not send response: {}", e);
        }
    }

    fn handle_response(&self, endpoint: &Arc<TunnelEndpoint>, packet: Packet) {
        let id = endpoint.id();
        let seq = packet.sequence();

        let Some(call) = endpoint.pending().take(seq) else {
            debug!(endpoint_id = %id, seq, "No pending call for response, dropping");
            return;
        };

        let decoded = self
            .context
            .pipeline()
            .open(&packet.payload)
            .map_err(ControlError::from)
            .and_then(|raw| decode_response(&raw, call.method()).map_err(ControlError::from));

        let response = match decoded {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint_id = %id, seq, "Unreadable response packet: {}", e);
                error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("unreadable tunnel response: {}", e),
                )
            }
        };

        debug!(
            endpoint_id = %id,
            seq,
            status = response.status().as_u16(),
            elapsed_ms = call.elapsed().as_millis() as u64,
            "Response delivered"
        );
        call.complete(response);
    }

    /// Log registry size and in-flight calls every `interval` until `shutdown`
    pub async fn run_stats(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let endpoints: Vec<_> = self.endpoints.read().await.values().cloned().collect();
                    let pending: usize = endpoints.iter().map(|e| e.pending().count()).sum();
                    info!(endpoints = endpoints.len(), pending, "Hub stats");
                }
            }
        }
    }
}

/// Seal `response` as the reply to `request`.
///
/// A response that cannot be sealed, or whose sealed form exceeds
/// `max_payload`, is replaced by a 502 carrying the reason, so the caller
/// still gets an answer under the same sequence.
fn reply_packet(
    pipeline: &Pipeline,
    request: &PacketHeader,
    response: &Response<Bytes>,
    max_payload: usize,
) -> Result<Packet, PipelineError> {
    let reason = match pipeline.seal(&encode_response(response)) {
        Ok(sealed) if sealed.len() <= max_payload => {
            let status = i32::from(response.status().as_u16());
            return Ok(Packet::response_to(request, status, sealed));
        }
        Ok(sealed) => format!(
            "response too large for tunnel frame ({} bytes sealed, limit {})",
            sealed.len(),
            max_payload
        ),
        Err(e) => format!("could not seal response: {}", e),
    };

    warn!(seq = request.sequence, "Replacing response: {}", reason);
    let fallback = error_response(StatusCode::BAD_GATEWAY, &reason);
    let sealed = pipeline.seal(&encode_response(&fallback))?;
    Ok(Packet::response_to(
        request,
        i32::from(StatusCode::BAD_GATEWAY.as_u16()),
        sealed,
    ))
}
