use num_bigint::{BigInt, Sign};
use p256::ecdh;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};

/// Ephemeral ECDH key agreement on NIST P-256.
///
/// The shared point is never used directly: the x-coordinate bytes are fed
/// through an iterated SHA-256 KDF (1-byte counter from 0) and the trailing
/// `size / 8` bytes of the accumulated digest string become the agreed key.
#[derive(Debug, Clone)]
pub struct Kas {
    sk: Option<SecretKey>,
    pk: Option<PublicKey>,
}

impl Kas {
    pub fn new() -> Self {
        Kas { sk: None, pk: None }
    }

    pub fn generate(&mut self) -> &mut Self {
        let sk = SecretKey::random(&mut OsRng);
        self.pk = Some(sk.public_key());
        self.sk = Some(sk);
        self
    }

    /// Rebuilds a keypair from a raw 32-byte scalar, as needed when a peer's
    /// secret key is reconstructed from shares.
    pub fn generate_from_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        if bytes.len() > 32 {
            return Err(ProtocolError::invalid("scalar longer than 32 bytes"));
        }
        let mut padded = [0u8; 32];
        padded[32 - bytes.len()..].copy_from_slice(bytes);
        let sk = SecretKey::from_slice(&padded)
            .map_err(|_| ProtocolError::invalid("bytes do not encode a P-256 scalar"))?;
        self.pk = Some(sk.public_key());
        self.sk = Some(sk);
        Ok(self)
    }

    pub fn public_key(&self) -> &PublicKey {
        self.pk.as_ref().expect("keypair has not been generated")
    }

    /// SEC1 encoding of the public key, as sent in register messages.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public_key().to_encoded_point(false).as_bytes().to_vec()
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.sk
            .as_ref()
            .expect("keypair has not been generated")
            .to_bytes()
            .to_vec()
    }

    /// Derives a `size`-bit shared key with the peer owning `peer_pk`.
    pub fn agree(&self, peer_pk: &PublicKey, size: usize) -> BigInt {
        assert!(size % 8 == 0, "agreed key length must be a whole byte count");
        let sk = self.sk.as_ref().expect("keypair has not been generated");
        let shared = ecdh::diffie_hellman(sk.to_nonzero_scalar(), peer_pk.as_affine());
        let z = shared.raw_secret_bytes();

        let mut counter: u8 = 0;
        let mut acc: Vec<u8> = Vec::with_capacity(size / 8);
        while acc.len() < size / 8 {
            let mut h = Sha256::new();
            h.update(z);
            h.update([counter]);
            acc.extend_from_slice(&h.finalize());
            counter = counter.wrapping_add(1);
        }
        BigInt::from_bytes_be(Sign::Plus, &acc[acc.len() - size / 8..])
    }
}

impl Default for Kas {
    fn default() -> Self {
        Kas::new()
    }
}

/// Parses a SEC1-encoded public key received from a peer.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| ProtocolError::invalid("bytes do not encode a P-256 point"))
}
