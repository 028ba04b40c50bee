//! Pending-call table
//!
//! Tracks requests sent through one tunnel endpoint and routes each Response
//! packet back to the caller waiting on the same sequence number.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::{Method, Response, Uri};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Receiving half held by the caller of a pending call
pub type ResponseReceiver = oneshot::Receiver<Response<Bytes>>;

/// One request awaiting its response
#[derive(Debug)]
pub struct PendingCall {
    sequence: u32,
    method: Method,
    uri: Uri,
    responder: oneshot::Sender<Response<Bytes>>,
    registered_at: Instant,
}

impl PendingCall {
    /// Create a call for `sequence` plus the receiver its response arrives on
    pub fn new(sequence: u32, method: Method, uri: Uri) -> (Self, ResponseReceiver) {
        let (responder, receiver) = oneshot::channel();
        let call = Self {
            sequence,
            method,
            uri,
            responder,
            registered_at: Instant::now(),
        };
        (call, receiver)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Method of the original request; decides whether a body is expected
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn elapsed(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Deliver the response. Returns false if the caller stopped waiting.
    pub fn complete(self, response: Response<Bytes>) -> bool {
        let sequence = self.sequence;
        if self.responder.send(response).is_err() {
            debug!(seq = sequence, "Caller gone before response arrived");
            return false;
        }
        true
    }
}

/// Calls in flight on one endpoint, keyed by sequence
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<u32, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `call`. A stale call under the same sequence is replaced and dropped.
    pub fn insert(&self, call: PendingCall) {
        let sequence = call.sequence;
        if let Some(stale) = self.calls.insert(sequence, call) {
            warn!(
                seq = sequence,
                age_ms = stale.elapsed().as_millis() as u64,
                "Replaced stale pending call after sequence wrap"
            );
        }
    }

    /// Remove and return the call for `sequence`
    pub fn take(&self, sequence: u32) -> Option<PendingCall> {
        self.calls.remove(&sequence).map(|(_, call)| call)
    }

    /// Deliver `response` to the call for `sequence`.
    /// Returns false if no such call exists or its caller is gone.
    pub fn complete(&self, sequence: u32, response: Response<Bytes>) -> bool {
        match self.take(sequence) {
            Some(call) => call.complete(response),
            None => false,
        }
    }

    /// Forget a call without answering it (timeout or send failure)
    pub fn cancel(&self, sequence: u32) -> bool {
        let removed = self.calls.remove(&sequence).is_some();
        if removed {
            debug!(seq = sequence, "Cancelled pending call");
        }
        removed
    }

    /// Answer every outstanding call with a response from `make_response`.
    /// Returns how many calls were failed.
    pub fn fail_all<F>(&self, make_response: F) -> usize
    where
        F: Fn() -> Response<Bytes>,
    {
        let sequences: Vec<u32> = self.calls.iter().map(|entry| *entry.key()).collect();

        sequences
            .into_iter()
            .filter_map(|sequence| self.take(sequence))
            .map(|call| call.complete(make_response()))
            .count()
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
