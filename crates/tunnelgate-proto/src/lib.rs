//! Tunnel Protocol Definitions
//!
//! This crate defines the binary packet format exchanged between two
//! tunnelgate nodes, plus the sequence generator used to correlate a
//! Response packet with the Request that caused it.

pub mod packet;
pub mod sequence;

pub use packet::{FramingError, Packet, PacketHeader, PacketType};
pub use sequence::SequenceGenerator;

/// Magic byte that opens every packet
pub const MAGIC: u8 = 110;

/// Maximum payload size accepted by the decoder (16MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Header carrying the out-of-band relay target of a tunneled request
pub const TARGET_HEADER: &str = "x-tunnelgate-target";
