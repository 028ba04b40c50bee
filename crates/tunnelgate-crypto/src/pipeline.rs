//! Compress+encrypt pipeline applied to every packet payload
//!
//! Outbound: `raw -> compress -> encrypt -> payload`.
//! Inbound:  `payload -> decrypt -> decompress -> raw`.

use thiserror::Error;

use crate::cipher::{CipherKey, CryptoError};
use crate::compress::{compress, decompress, CompressionError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Payload pipeline bound to one pre-shared key
#[derive(Debug, Clone)]
pub struct Pipeline {
    key: CipherKey,
}

impl Pipeline {
    pub fn new(key: CipherKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    /// Protect a raw payload for the wire
    pub fn seal(&self, raw: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let compressed = compress(raw)?;
        let sealed = self.key.encrypt(&compressed)?;
        tracing::trace!(
            raw = raw.len(),
            compressed = compressed.len(),
            sealed = sealed.len(),
            "Sealed payload"
        );
        Ok(sealed)
    }

    /// Recover the raw payload from a wire payload
    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let compressed = self.key.decrypt(payload)?;
        Ok(decompress(&compressed)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline::new(CipherKey::from_bytes(&[0x42; 32]).unwrap())
    }

    #[test]
    fn test_seal_open() {
        let pipeline = pipeline();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

        let sealed = pipeline.seal(raw).unwrap();
        assert_eq!(pipeline.open(&sealed).unwrap(), raw);
    }

    #[test]
    fn test_seal_open_empty() {
        let pipeline = pipeline();
        let sealed = pipeline.seal(b"").unwrap();
        assert!(pipeline.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_open_short_payload_is_crypto_error() {
        let result = pipeline().open(&[1, 2, 3]);
        assert!(matches!(
            result,
            Err(PipelineError::Crypto(CryptoError::CiphertextTooShort(3)))
        ));
    }

    #[test]
    fn test_open_with_wrong_key_fails_decompression() {
        let sealed = pipeline().seal(b"hello tunnel").unwrap();
        let other = Pipeline::new(CipherKey::from_bytes(&[0x24; 32]).unwrap());

        assert!(matches!(
            other.open(&sealed),
            Err(PipelineError::Compression(_))
        ));
    }

    #[test]
    fn test_open_uncompressed_ciphertext_fails() {
        let pipeline = pipeline();
        let encrypted_only = pipeline.key().encrypt(b"not compressed").unwrap();

        assert!(matches!(
            pipeline.open(&encrypted_only),
            Err(PipelineError::Compression(_))
        ));
    }
}
