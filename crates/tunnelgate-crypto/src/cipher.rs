//! AES in full-block CFB mode with a random IV prefix

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// AES block size, also the IV length
pub const BLOCK_SIZE: usize = 16;

/// Cipher errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes (expected 16, 24 or 32)")]
    InvalidKeyLength(usize),

    #[error("Invalid hex key: {0}")]
    InvalidHexKey(String),

    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// Pre-shared symmetric key
#[derive(Clone, PartialEq, Eq)]
pub enum CipherKey {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl CipherKey {
    pub fn from_bytes(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = || CryptoError::InvalidKeyLength(key.len());
        match key.len() {
            16 => Ok(Self::Aes128(key.try_into().map_err(|_| invalid())?)),
            24 => Ok(Self::Aes192(key.try_into().map_err(|_| invalid())?)),
            32 => Ok(Self::Aes256(key.try_into().map_err(|_| invalid())?)),
            _ => Err(invalid()),
        }
    }

    /// Parse a hex-encoded key (32, 48 or 64 hex characters)
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidHexKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn key_len(&self) -> usize {
        self.as_bytes().len()
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Aes128(k) => k,
            Self::Aes192(k) => k,
            Self::Aes256(k) => k,
        }
    }

    /// Encrypt `plaintext`, returning `iv || ciphertext`.
    ///
    /// A fresh IV is drawn for every call, so equal plaintexts encrypt differently.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut output = vec![0u8; BLOCK_SIZE + plaintext.len()];
        let (iv, body) = output.split_at_mut(BLOCK_SIZE);
        OsRng.fill_bytes(iv);
        body.copy_from_slice(plaintext);

        let key = self.as_bytes();
        let bad_key = |_| CryptoError::InvalidKeyLength(key.len());
        match self {
            Self::Aes128(_) => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt(body),
            Self::Aes192(_) => cfb_mode::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt(body),
            Self::Aes256(_) => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .encrypt(body),
        }

        Ok(output)
    }

    /// Decrypt `iv || ciphertext` produced by [`CipherKey::encrypt`]
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if input.len() < BLOCK_SIZE {
            return Err(CryptoError::CiphertextTooShort(input.len()));
        }
        let (iv, ciphertext) = input.split_at(BLOCK_SIZE);
        let mut body = ciphertext.to_vec();

        let key = self.as_bytes();
        let bad_key = |_| CryptoError::InvalidKeyLength(key.len());
        match self {
            Self::Aes128(_) => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt(&mut body),
            Self::Aes192(_) => cfb_mode::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt(&mut body),
            Self::Aes256(_) => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map_err(bad_key)?
                .decrypt(&mut body),
        }

        Ok(body)
    }
}

// Never print key material
impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherKey(AES-{})", self.key_len() * 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_KEY: &str = "904F4BD34C303D2A2F5C609D3DEF710FEEBDE497DF4840380927D744D343D4CD";

    #[test]
    fn test_encrypt_decrypt() {
        let key = CipherKey::from_hex(HEX_KEY).unwrap();
        let input = b"To be encrypted content.";

        let encrypted = key.encrypt(input).unwrap();
        assert_eq!(encrypted.len(), BLOCK_SIZE + input.len());
        assert_ne!(&encrypted[BLOCK_SIZE..], &input[..]);

        let decrypted = key.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, input);
    }

    #[test]
    fn test_all_key_sizes() {
        for len in [16, 24, 32] {
            let key = CipherKey::from_bytes(&vec![7u8; len]).unwrap();
            assert_eq!(key.key_len(), len);

            let encrypted = key.encrypt(b"payload").unwrap();
            assert_eq!(key.decrypt(&encrypted).unwrap(), b"payload");
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let key = CipherKey::from_hex(HEX_KEY).unwrap();
        let encrypted = key.encrypt(b"").unwrap();
        assert_eq!(encrypted.len(), BLOCK_SIZE);
        assert!(key.decrypt(&encrypted).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = CipherKey::from_hex(HEX_KEY).unwrap();
        let first = key.encrypt(b"same input").unwrap();
        let second = key.encrypt(b"same input").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_decrypt_too_short() {
        let key = CipherKey::from_hex(HEX_KEY).unwrap();
        assert_eq!(
            key.decrypt(&[0u8; 15]),
            Err(CryptoError::CiphertextTooShort(15))
        );
    }

    #[test]
    fn test_wrong_key_does_not_recover_plaintext() {
        let key = CipherKey::from_hex(HEX_KEY).unwrap();
        let other = CipherKey::from_bytes(&[1u8; 32]).unwrap();

        let encrypted = key.encrypt(b"secret message").unwrap();
        assert_ne!(other.decrypt(&encrypted).unwrap(), b"secret message");
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(
            CipherKey::from_bytes(&[0u8; 20]),
            Err(CryptoError::InvalidKeyLength(20))
        );
        assert!(matches!(
            CipherKey::from_hex("not-hex"),
            Err(CryptoError::InvalidHexKey(_))
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let key = CipherKey::from_hex(HEX_KEY).unwrap();
        assert_eq!(format!("{:?}", key), "CipherKey(AES-256)");
    }
}
