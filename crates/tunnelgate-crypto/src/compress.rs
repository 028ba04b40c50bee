//! Gzip compression of packet payloads

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Compression error: {0}")]
pub struct CompressionError(#[from] std::io::Error);

pub fn compress(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(input.len() / 2 + 32),
        Compression::default(),
    );
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip stream; malformed or truncated input is an error
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut decoder = GzDecoder::new(input);
    let mut output = Vec::with_capacity(input.len() * 2);
    decoder.read_to_end(&mut output)?;
    Ok(output)
}
