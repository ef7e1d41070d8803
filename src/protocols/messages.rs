use std::collections::HashMap;

use nalgebra::DVector;
use num_bigint::{BigInt, Sign};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buildingblocks::aead::EncryptedMessage;
use crate::buildingblocks::joye_libert::{EncryptedNumber, RecoveryShare};
use crate::buildingblocks::shamir::Share;
use crate::error::{ProtocolError, Result};

/// Registration: a user id and the two ephemeral public keys (SEC1 bytes),
/// one for protection-key derivation and one for channel keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub user: u16,
    pub pk_s: Vec<u8>,
    pub pk_c: Vec<u8>,
}

/// Key setup: encrypted integer shares of the sender's protection key, one
/// envelope per recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySetupMessage {
    pub user: u16,
    pub shares: HashMap<u16, EncryptedMessage>,
}

/// Online protection: encrypted mask-seed shares plus the protected input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptMessage {
    pub user: u16,
    pub shares: HashMap<u16, EncryptedMessage>,
    pub protected: Vec<EncryptedNumber>,
}

/// Online construction: the mask-seed shares this client holds, keyed by
/// seed owner, and a recovery share when some users dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructMessage {
    pub user: u16,
    pub seed_shares: HashMap<u16, Share>,
    pub recovery: Option<RecoveryShare>,
}

/// Mask-pairwise protocol: encrypted (key share, seed share) pairs, one
/// envelope per recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingSharesMessage {
    pub user: u16,
    pub shares: HashMap<u16, EncryptedMessage>,
}

/// Mask-pairwise protocol: the input blinded by the pairwise masks and the
/// self mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskedInputMessage {
    pub user: u16,
    pub masked: DVector<BigInt>,
}

/// Mask-pairwise protocol: seed shares for the survivors and key shares for
/// the dropped, keyed by owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmaskingMessage {
    pub user: u16,
    pub key_shares: HashMap<u16, Share>,
    pub seed_shares: HashMap<u16, Share>,
}

/// Serializes a message for the transport envelope.
pub fn to_wire<T: Serialize>(message: &T) -> Vec<u8> {
    bincode::serialize(message).expect("round messages always serialize")
}

/// Parses a message from the transport envelope.
pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ProtocolError::invalid(format!("bad envelope: {e}")))
}

// AEAD plaintext formats. All integers are big-endian; the share bytes run
// to the end of the message unless length-prefixed.

/// `u(2) || v(2) || share` with a signed share encoding.
pub fn encode_key_share(u: u16, v: u16, share: &BigInt) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&u.to_be_bytes());
    out.extend_from_slice(&v.to_be_bytes());
    out.extend_from_slice(&share.to_signed_bytes_be());
    out
}

pub fn decode_key_share(bytes: &[u8]) -> Result<(u16, u16, BigInt)> {
    let (u, v, rest) = split_tags(bytes)?;
    Ok((u, v, BigInt::from_signed_bytes_be(rest)))
}

/// `u(2) || v(2) || share` with a positive share encoding.
pub fn encode_seed_share(u: u16, v: u16, share: &BigInt) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&u.to_be_bytes());
    out.extend_from_slice(&v.to_be_bytes());
    out.extend_from_slice(&share.to_bytes_be().1);
    out
}

pub fn decode_seed_share(bytes: &[u8]) -> Result<(u16, u16, BigInt)> {
    let (u, v, rest) = split_tags(bytes)?;
    Ok((u, v, BigInt::from_bytes_be(Sign::Plus, rest)))
}

/// `u(2) || v(2) || lenK(2) || kshare || bshare`, both shares positive.
pub fn encode_masking_share(u: u16, v: u16, kshare: &BigInt, bshare: &BigInt) -> Vec<u8> {
    let kbytes = kshare.to_bytes_be().1;
    let mut out = Vec::new();
    out.extend_from_slice(&u.to_be_bytes());
    out.extend_from_slice(&v.to_be_bytes());
    out.extend_from_slice(&(kbytes.len() as u16).to_be_bytes());
    out.extend_from_slice(&kbytes);
    out.extend_from_slice(&bshare.to_bytes_be().1);
    out
}

pub fn decode_masking_share(bytes: &[u8]) -> Result<(u16, u16, BigInt, BigInt)> {
    let (u, v, rest) = split_tags(bytes)?;
    if rest.len() < 2 {
        return Err(ProtocolError::invalid("truncated share message"));
    }
    let klen = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + klen {
        return Err(ProtocolError::invalid("truncated share message"));
    }
    let kshare = BigInt::from_bytes_be(Sign::Plus, &rest[2..2 + klen]);
    let bshare = BigInt::from_bytes_be(Sign::Plus, &rest[2 + klen..]);
    Ok((u, v, kshare, bshare))
}

fn split_tags(bytes: &[u8]) -> Result<(u16, u16, &[u8])> {
    if bytes.len() < 4 {
        return Err(ProtocolError::invalid("truncated share message"));
    }
    let u = u16::from_be_bytes([bytes[0], bytes[1]]);
    let v = u16::from_be_bytes([bytes[2], bytes[3]]);
    Ok((u, v, &bytes[4..]))
}
