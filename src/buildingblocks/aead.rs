use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes128Gcm, Nonce};
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::One;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

const KEY_BYTES: usize = 16;
const TAG_BYTES: usize = 16;
const NONCE_BYTES: usize = 12;

/// An AES-GCM-128 ciphertext together with its tag and nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub ct: Vec<u8>,
    pub tag: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// A point-to-point channel key. Derived from the agreed ECDH secret by
/// truncation to exactly 16 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    key: [u8; KEY_BYTES],
}

impl EncryptionKey {
    /// Builds a key from an agreed secret, masking integers wider than 128
    /// bits down to their low 128 bits.
    pub fn new(secret: &BigInt) -> Self {
        let masked = secret.mod_floor(&(BigInt::one() << (KEY_BYTES * 8)));
        let bytes = masked.to_bytes_be().1;
        let mut key = [0u8; KEY_BYTES];
        key[KEY_BYTES - bytes.len()..].copy_from_slice(&bytes);
        EncryptionKey { key }
    }

    /// Builds a key from raw bytes; anything past the first 16 is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < KEY_BYTES {
            return Err(ProtocolError::invalid(
                "channel key must be at least 16 bytes",
            ));
        }
        let mut key = [0u8; KEY_BYTES];
        key.copy_from_slice(&bytes[..KEY_BYTES]);
        Ok(EncryptionKey { key })
    }

    pub fn encrypt(&self, message: &[u8]) -> Result<EncryptedMessage> {
        let cipher = Aes128Gcm::new(&self.key.into());
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let mut ct = cipher
            .encrypt(&nonce, message)
            .map_err(|_| ProtocolError::invalid("message too large to encrypt"))?;
        let tag = ct.split_off(ct.len() - TAG_BYTES);
        Ok(EncryptedMessage {
            ct,
            tag,
            nonce: nonce.to_vec(),
        })
    }

    /// Verifies the tag and returns the plaintext; any mismatch between the
    /// key, nonce, ciphertext, or tag is an authentication failure.
    pub fn decrypt(&self, e: &EncryptedMessage) -> Result<Vec<u8>> {
        if e.nonce.len() != NONCE_BYTES || e.tag.len() != TAG_BYTES {
            return Err(ProtocolError::auth("malformed nonce or tag"));
        }
        let cipher = Aes128Gcm::new(&self.key.into());
        let mut buf = e.ct.clone();
        buf.extend_from_slice(&e.tag);
        cipher
            .decrypt(Nonce::from_slice(&e.nonce), buf.as_ref())
            .map_err(|_| ProtocolError::auth("ciphertext tag verification failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> EncryptionKey {
        EncryptionKey::new(&BigInt::from(0xDEADBEEFu32))
    }

    #[test]
    fn test_roundtrip() {
        let k = key();
        let msg = b"attack at dawn";
        let e = k.encrypt(msg).unwrap();
        assert_eq!(k.decrypt(&e).unwrap(), msg);
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let k = key();
        let a = k.encrypt(b"x").unwrap();
        let b = k.encrypt(b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_tampering_detected() {
        let k = key();
        let e = k.encrypt(b"some payload bytes").unwrap();

        let mut bad = e.clone();
        bad.ct[0] ^= 0x01;
        assert!(matches!(
            k.decrypt(&bad),
            Err(ProtocolError::AuthenticationFailure(_))
        ));

        let mut bad = e.clone();
        bad.tag[3] ^= 0x80;
        assert!(matches!(
            k.decrypt(&bad),
            Err(ProtocolError::AuthenticationFailure(_))
        ));

        let mut bad = e.clone();
        bad.nonce[7] ^= 0x10;
        assert!(matches!(
            k.decrypt(&bad),
            Err(ProtocolError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let e = key().encrypt(b"payload").unwrap();
        let other = EncryptionKey::new(&BigInt::from(1u32));
        assert!(other.decrypt(&e).is_err());
    }

    #[test]
    fn test_wide_key_masked() {
        let secret = BigInt::from(0x42u32);
        let wide = &secret + (BigInt::one() << 300);
        let e = EncryptionKey::new(&secret).encrypt(b"m").unwrap();
        assert_eq!(EncryptionKey::new(&wide).decrypt(&e).unwrap(), b"m");
    }

    #[test]
    fn test_byte_keys_truncated_to_16() {
        let long = EncryptionKey::from_bytes(&[7u8; 24]).unwrap();
        let exact = EncryptionKey::from_bytes(&[7u8; 16]).unwrap();
        let e = long.encrypt(b"payload").unwrap();
        assert_eq!(exact.decrypt(&e).unwrap(), b"payload");
        assert!(EncryptionKey::from_bytes(&[7u8; 15]).is_err());
    }
}
