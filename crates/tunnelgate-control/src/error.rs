use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tunnelgate_crypto::PipelineError;
use tunnelgate_proto::FramingError;

use crate::endpoint::EndpointId;
use crate::http_wire::HttpWireError;

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Tunnel endpoint {0} is closed")]
    EndpointClosed(EndpointId),

    #[error("No tunnel endpoint available")]
    EndpointNotFound,

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Payload error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("HTTP wire error: {0}")]
    HttpWire(#[from] HttpWireError),

    #[error("No response from peer within {0:?}")]
    Timeout(Duration),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl ControlError {
    /// Status the original caller should see for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
