//! Tunnel control plane
//!
//! Everything above the wire format and below the HTTP front door:
//!
//! - [`TunnelEndpoint`]: one WebSocket connection with its reader/writer
//!   pumps and pending-call table
//! - [`Hub`]: endpoint registry and the dispatcher that serves Request
//!   packets and completes pending calls from Response packets
//! - [`Forwarder`]: sends an inbound request through the tunnel and waits
//!   for the answer, bounded by a deadline
//! - [`RelayExecutor`]: performs tunneled requests on the peer side
//! - [`ReconnectSupervisor`]: keeps an outbound tunnel connected

pub mod context;
pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod http_wire;
pub mod hub;
pub mod pending;
pub mod relay;
pub mod selector;
pub mod supervisor;

pub use context::{TunnelContext, TunnelSettings};
pub use endpoint::{EndpointId, EndpointOrigin, Ingress, TunnelEndpoint};
pub use error::ControlError;
pub use forwarder::Forwarder;
pub use http_wire::{HttpWireError, StatusText};
pub use hub::Hub;
pub use pending::{PendingCall, PendingCalls};
pub use relay::RelayExecutor;
pub use selector::{EndpointSelector, OldestEndpoint};
pub use supervisor::ReconnectSupervisor;
