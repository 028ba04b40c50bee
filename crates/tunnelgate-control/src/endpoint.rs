//! Tunnel endpoint: one live WebSocket connection to a peer node
//!
//! Each endpoint runs exactly one reader task and one writer task. Nothing
//! else touches the socket: senders enqueue encoded packets on a bounded
//! outbound queue that only the writer drains, and inbound binary messages
//! are handed to the hub's shared ingress queue by the reader.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::StatusCode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tunnelgate_proto::Packet;
use tunnelgate_transport_websocket::{Message, WebSocketConfig, WsError};

use crate::error::ControlError;
use crate::http_wire::error_response;
use crate::pending::{PendingCall, PendingCalls};

/// Hub-local endpoint identity. Never sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOrigin {
    /// Accepted from a peer; torn down for good when the connection drops
    Inbound,
    /// Dialed by this node; the reconnect supervisor replaces it when it drops
    Outbound,
}

impl fmt::Display for EndpointOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointOrigin::Inbound => f.write_str("inbound"),
            EndpointOrigin::Outbound => f.write_str("outbound"),
        }
    }
}

/// One inbound binary message, tagged with the endpoint it arrived on
#[derive(Debug)]
pub struct Ingress {
    pub endpoint: Arc<TunnelEndpoint>,
    pub data: Bytes,
}

/// Live handle to one physical tunnel connection
pub struct TunnelEndpoint {
    id: EndpointId,
    origin: EndpointOrigin,
    peer: String,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
    /// Fired when either pump stops or the endpoint is closed
    teardown: CancellationToken,
    pending: PendingCalls,
    connected_at: Instant,
}

impl fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("pending", &self.pending.count())
            .finish()
    }
}

impl TunnelEndpoint {
    /// Take ownership of an established connection and start its pumps.
    ///
    /// Inbound messages are pushed onto `ingress`; when that queue is full the
    /// reader waits, which stops reading from the socket.
    pub fn start<S>(
        id: EndpointId,
        origin: EndpointOrigin,
        peer: String,
        stream: S,
        ingress: mpsc::Sender<Ingress>,
        config: &WebSocketConfig,
    ) -> Arc<Self>
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let (sink, source) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));

        let endpoint = Arc::new(Self {
            id,
            origin,
            peer,
            outbound: Mutex::new(Some(outbound_tx)),
            closed: AtomicBool::new(false),
            teardown: CancellationToken::new(),
            pending: PendingCalls::new(),
            connected_at: Instant::now(),
        });

        info!(
            endpoint_id = %id,
            origin = %origin,
            peer = %endpoint.peer,
            "Tunnel endpoint connected"
        );

        tokio::spawn(write_pump(
            sink,
            outbound_rx,
            id,
            endpoint.teardown.clone(),
            config.keep_alive_interval,
            config.write_timeout,
        ));
        tokio::spawn(read_pump(
            source,
            Arc::clone(&endpoint),
            ingress,
            config.max_idle_timeout,
        ));

        endpoint
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn origin(&self) -> EndpointOrigin {
        self.origin
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Usable for new sends: not closed and both pumps still running
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.teardown.is_cancelled()
    }

    /// Resolves once the connection has failed or the endpoint was closed
    pub async fn torn_down(&self) {
        self.teardown.cancelled().await
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue `packet` for the writer.
    ///
    /// When `call` is given it is registered under the packet's sequence
    /// before the packet is queued, so the response can never outrun it.
    /// Waits while the outbound queue is full.
    pub async fn send_frame(
        &self,
        packet: Packet,
        call: Option<PendingCall>,
    ) -> Result<(), ControlError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ControlError::EndpointClosed(self.id));
        }

        let encoded = packet.encode()?;
        let sequence = packet.sequence();

        let registered = call.is_some();
        if let Some(call) = call {
            self.pending.insert(call);

            // close() may have drained the table between the check above
            // and the insert
            if self.closed.load(Ordering::SeqCst) {
                self.pending.cancel(sequence);
                return Err(ControlError::EndpointClosed(self.id));
            }
        }

        let sent = match self.sender() {
            Some(sender) => sender.send(encoded).await.is_ok(),
            None => false,
        };

        if !sent {
            if registered {
                self.pending.cancel(sequence);
            }
            return Err(ControlError::EndpointClosed(self.id));
        }

        trace!(
            endpoint_id = %self.id,
            seq = sequence,
            packet_type = ?packet.packet_type(),
            "Packet queued"
        );
        Ok(())
    }

    /// Mark the endpoint unusable and shut it down.
    ///
    /// Closes the outbound queue (the writer flushes what is queued, then
    /// sends a close message), stops the reader, and answers every pending
    /// call with 502. Returns false if the endpoint was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        drop(
            self.outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        self.teardown.cancel();

        let failed = self
            .pending
            .fail_all(|| error_response(StatusCode::BAD_GATEWAY, "tunnel endpoint closed"));
        if failed > 0 {
            warn!(
                endpoint_id = %self.id,
                failed,
                "Failed pending calls on endpoint teardown"
            );
        }

        info!(
            endpoint_id = %self.id,
            origin = %self.origin,
            peer = %self.peer,
            "Tunnel endpoint closed"
        );
        true
    }
}

async fn write_message<W>(sink: &mut W, message: Message, limit: Duration) -> Result<(), WsError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(limit, sink.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(WsError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("write timed out after {:?}", limit),
        ))),
    }
}

/// Single writer: drains the outbound queue in order and sends keepalive pings
async fn write_pump<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<Bytes>,
    id: EndpointId,
    teardown: CancellationToken,
    keep_alive: Duration,
    write_timeout: Duration,
) where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut keepalive =
        tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(frame) => {
                    let message = Message::Binary(Vec::from(frame));
                    if let Err(e) = write_message(&mut sink, message, write_timeout).await {
                        warn!(endpoint_id = %id, "WebSocket write failed: {}", e);
                        break;
                    }
                }
                None => {
                    debug!(endpoint_id = %id, "Outbound queue closed, sending close");
                    let _ = write_message(&mut sink, Message::Close(None), write_timeout).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = write_message(&mut sink, Message::Ping(Vec::new()), write_timeout).await {
                    warn!(endpoint_id = %id, "Keepalive ping failed: {}", e);
                    break;
                }
            }
        }
    }

    teardown.cancel();
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    debug!(endpoint_id = %id, "Writer task ended");
}

/// Single reader: forwards binary messages to the hub until the connection
/// fails, goes idle, or the endpoint is torn down
async fn read_pump<R>(
    mut source: R,
    endpoint: Arc<TunnelEndpoint>,
    ingress: mpsc::Sender<Ingress>,
    idle_timeout: Duration,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let id = endpoint.id;

    loop {
        let next = tokio::select! {
            _ = endpoint.teardown.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, source.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(endpoint_id = %id, "No traffic for {:?}, dropping connection", idle_timeout);
                break;
            }
            Ok(None) => {
                info!(endpoint_id = %id, "Connection closed by peer");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(endpoint_id = %id, "WebSocket read failed: {}", e);
                break;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Binary(data) => {
                    let item = Ingress {
                        endpoint: Arc::clone(&endpoint),
                        data: Bytes::from(data),
                    };
                    if ingress.send(item).await.is_err() {
                        debug!(endpoint_id = %id, "Ingress queue closed");
                        break;
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {
                    trace!(endpoint_id = %id, "Keepalive received");
                }
                Message::Close(frame) => {
                    info!(endpoint_id = %id, ?frame, "Peer sent close");
                    break;
                }
                Message::Text(_) => {
                    warn!(endpoint_id = %id, "Ignoring unexpected text message");
                }
                Message::Frame(_) => {}
            },
        }
    }

    endpoint.teardown.cancel();
    debug!(endpoint_id = %id, "Reader task ended");
}
