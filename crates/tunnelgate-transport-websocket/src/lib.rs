//! WebSocket transport for the tunnel
//!
//! Tunnel endpoints talk over plain `ws://` connections carrying one packet
//! per binary message. This crate owns everything below the packet layer:
//!
//! - **Dialing**: [`dial`] opens an outbound connection to a peer URL
//! - **Accepting**: [`WebSocketListener`] accepts on a dedicated socket, and
//!   [`upgrade`] completes the handshake for connections that arrive through
//!   an HTTP server
//! - **Reconnecting**: [`ReconnectManager`] paces redial attempts

pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod reconnect;
pub mod upgrade;

pub use config::WebSocketConfig;
pub use connector::{dial, ClientStream};
pub use error::{TransportError, TransportResult};
pub use listener::{ServerStream, WebSocketListener};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use upgrade::UpgradedStream;

pub use tokio_tungstenite::tungstenite::{Error as WsError, Message};
