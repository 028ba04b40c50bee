//! Bridges inbound HTTP requests onto the tunnel

use std::sync::Arc;

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Request, Response};
use tracing::{debug, warn};
use tunnelgate_proto::{Packet, TARGET_HEADER};

use crate::error::ControlError;
use crate::http_wire::{encode_request, HttpWireError};
use crate::hub::Hub;
use crate::pending::PendingCall;

/// Sends requests through the hub's selected endpoint and waits for the
/// peer's answer
#[derive(Debug, Clone)]
pub struct Forwarder {
    hub: Arc<Hub>,
}

impl Forwarder {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Relay `request` to `target` through the tunnel.
    ///
    /// The target travels in the `X-Tunnelgate-Target` header, overwriting any
    /// value the client sent. Fails with `EndpointNotFound` (nothing is sent)
    /// when no endpoint is available, and with `Timeout` when the peer does
    /// not answer within the configured forward timeout; the pending call is
    /// removed in that case.
    pub async fn forward(
        &self,
        target: &str,
        mut request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ControlError> {
        let endpoint = self
            .hub
            .select_endpoint()
            .await
            .ok_or(ControlError::EndpointNotFound)?;

        let marker = HeaderValue::from_str(target)
            .map_err(|_| HttpWireError::Invalid(format!("target {:?} is not a valid header", target)))?;
        request.headers_mut().insert(TARGET_HEADER, marker);

        let context = self.hub.context();
        let sealed = context.pipeline().seal(&encode_request(&request))?;

        let sequence = context.next_sequence();
        let (call, response) =
            PendingCall::new(sequence, request.method().clone(), request.uri().clone());

        endpoint
            .send_frame(Packet::request(sequence, sealed), Some(call))
            .await?;

        debug!(
            endpoint_id = %endpoint.id(),
            seq = sequence,
            method = %request.method(),
            uri = %request.uri(),
            target = %target,
            "Request forwarded"
        );

        let deadline = context.settings().forward_timeout;
        match tokio::time::timeout(deadline, response).await {
            Ok(Ok(response)) => Ok(response),
            // Responder dropped without an answer
            Ok(Err(_)) => Err(ControlError::EndpointClosed(endpoint.id())),
            Err(_) => {
                endpoint.pending().cancel(sequence);
                warn!(
                    endpoint_id = %endpoint.id(),
                    seq = sequence,
                    uri = %request.uri(),
                    "No response within {:?}",
                    deadline
                );
                Err(ControlError::Timeout(deadline))
            }
        }
    }
}
