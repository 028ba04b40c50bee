//! Payload protection for tunnel packets
//!
//! Outbound payloads are compressed and then encrypted; inbound payloads are
//! decrypted and then decompressed. Both nodes must hold the same pre-shared
//! key. See [`Pipeline`].

pub mod cipher;
pub mod compress;
pub mod pipeline;

pub use cipher::{CipherKey, CryptoError, BLOCK_SIZE};
pub use compress::{compress, decompress, CompressionError};
pub use pipeline::{Pipeline, PipelineError};
