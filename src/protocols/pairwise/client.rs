use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;
use nalgebra::DVector;
use num_bigint::{BigInt, RandBigInt, Sign};
use num_traits::Zero;
use paste::paste;
use rand::rngs::OsRng;

use crate::buildingblocks::aead::{EncryptedMessage, EncryptionKey};
use crate::buildingblocks::key_agreement::{public_key_from_bytes, Kas};
use crate::buildingblocks::prg::PRG_SECURITY;
use crate::buildingblocks::shamir::Share;
use crate::buildingblocks::utils::{add_vectors, subs_vectors};
use crate::error::{ProtocolError, Result};
use crate::generate_getters_and_setters;
use crate::protocols::messages::{
    decode_masking_share, encode_masking_share, MaskedInputMessage, MaskingSharesMessage,
    RegisterMessage, UnmaskingMessage,
};
use crate::protocols::pairwise::PairwiseParams;

/// A client of the mask-pairwise aggregation protocol.
///
/// Nothing survives a round: key pairs, channel keys, and shares are all
/// re-established, so `new_fl_step` resets the whole per-round state.
pub struct Client {
    pub user: u16,
    params: PairwiseParams,
    step: u64,
    mask: DVector<BigInt>,
    seed: Option<BigInt>,
    input: Option<DVector<BigInt>>,
    eshares: Option<HashMap<u16, EncryptedMessage>>,
    ckeys: HashMap<u16, BigInt>,
    round1: Vec<u16>,
    round2: Vec<u16>,
    round4: Vec<u16>,
    seed_shares: HashMap<u16, Share>,
    key_shares: HashMap<u16, Share>,
    dh_public: BTreeMap<u16, Vec<u8>>,
    kas: Kas,
    kac: Kas,
}

generate_getters_and_setters! {
    Client, user,
    seed: BigInt,
    input: DVector<BigInt>,
    eshares: HashMap<u16, EncryptedMessage>
}

impl Client {
    pub fn new(user: u16, params: PairwiseParams) -> Self {
        let dimension = params.dimension;
        Client {
            user,
            params,
            step: 1,
            mask: DVector::from_element(dimension, BigInt::zero()),
            seed: None,
            input: None,
            eshares: None,
            ckeys: HashMap::new(),
            round1: Vec::new(),
            round2: Vec::new(),
            round4: Vec::new(),
            seed_shares: HashMap::new(),
            key_shares: HashMap::new(),
            dh_public: BTreeMap::new(),
            kas: Kas::new(),
            kac: Kas::new(),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Starts a new round. Everything except the identity is rebuilt.
    pub fn new_fl_step(&mut self) {
        self.step += 1;
        self.mask = DVector::from_element(self.params.dimension, BigInt::zero());
        self.seed = None;
        self.input = None;
        self.eshares = None;
        self.ckeys.clear();
        self.round1.clear();
        self.round2.clear();
        self.round4.clear();
        self.seed_shares.clear();
        self.key_shares.clear();
        self.dh_public.clear();
        self.kas = Kas::new();
        self.kac = Kas::new();
    }

    /// Round 0 - AdvertiseKeys: generates and announces the key pairs.
    pub fn advertise_keys(&mut self) -> Result<RegisterMessage> {
        self.kas.generate();
        self.kac.generate();
        self.round1 = vec![self.user];
        Ok(RegisterMessage {
            user: self.user,
            pk_s: self.kas.public_bytes(),
            pk_c: self.kac.public_bytes(),
        })
    }

    /// Round 1 - ShareKeys: derives channel keys and shares both the fresh
    /// mask seed and the DH secret key with every peer.
    pub fn share_keys(
        &mut self,
        alldhpks: &BTreeMap<u16, Vec<u8>>,
        alldhpkc: &BTreeMap<u16, Vec<u8>>,
    ) -> Result<MaskingSharesMessage> {
        if alldhpks.keys().ne(alldhpkc.keys()) {
            return Err(ProtocolError::invalid("mismatched peer directories"));
        }
        if alldhpkc.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "share_keys",
                got: alldhpkc.len(),
                need: self.params.threshold,
            });
        }
        let distinct: HashSet<&Vec<u8>> = alldhpks.values().collect();
        if distinct.len() != alldhpks.len() {
            return Err(ProtocolError::invalid("duplicate public keys"));
        }
        let distinct: HashSet<&Vec<u8>> = alldhpkc.values().collect();
        if distinct.len() != alldhpkc.len() {
            return Err(ProtocolError::invalid("duplicate public keys"));
        }

        for &vuser in alldhpks.keys() {
            if vuser != self.user && !self.round1.contains(&vuser) {
                self.round1.push(vuser);
            }
        }
        self.round1.sort_unstable();

        for (&vuser, pk_c) in alldhpkc {
            if vuser == self.user {
                continue;
            }
            self.ckeys
                .insert(vuser, self.kac.agree(&public_key_from_bytes(pk_c)?, 256));
        }

        let seed: BigInt = OsRng.gen_biguint(PRG_SECURITY as u64).into();
        let seed_shares =
            self.params
                .ss_seed
                .share(self.params.threshold, self.params.nclients, &seed);
        self.set_seed(seed);

        let dh_scalar = BigInt::from_bytes_be(Sign::Plus, &self.kas.secret_bytes());
        let key_shares =
            self.params
                .ss_key
                .share(self.params.threshold, self.params.nclients, &dh_scalar);

        let mut encrypted = HashMap::new();
        for (kshare, bshare) in key_shares.into_iter().zip(seed_shares) {
            assert_eq!(kshare.idx, bshare.idx, "misaligned share lists");
            let vuser = kshare.idx;
            if vuser == self.user {
                self.key_shares.insert(self.user, kshare);
                self.seed_shares.insert(self.user, bshare);
                continue;
            }
            let channel = EncryptionKey::new(&self.ckeys[&vuser]);
            let message = encode_masking_share(
                self.user,
                vuser,
                kshare.value.value(),
                bshare.value.value(),
            );
            encrypted.insert(vuser, channel.encrypt(&message)?);
        }

        self.dh_public = alldhpks.clone();
        Ok(MaskingSharesMessage {
            user: self.user,
            shares: encrypted,
        })
    }

    /// Round 2 - MaskedInputCollection: blinds the input with the pairwise
    /// masks and the self mask. The received envelopes are held back and
    /// only opened during unmasking.
    pub fn masked_input_collection(
        &mut self,
        eshares: &HashMap<u16, EncryptedMessage>,
    ) -> Result<MaskedInputMessage> {
        if eshares.len() + 1 < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "masked_input_collection",
                got: eshares.len() + 1,
                need: self.params.threshold,
            });
        }

        self.round2 = vec![self.user];
        self.round2.extend(eshares.keys().copied());
        self.round2.sort_unstable();
        self.set_eshares(eshares.clone());

        let modulus = self.params.mask_modulus();
        for (&vuser, pk_s) in &self.dh_public {
            if vuser == self.user {
                continue;
            }
            let sv = self
                .kas
                .agree(&public_key_from_bytes(pk_s)?, self.params.keysize);
            let pairwise = self.params.prg.eval(&sv);
            self.mask = if vuser > self.user {
                subs_vectors(&self.mask, &pairwise, &modulus)
            } else {
                add_vectors(&self.mask, &pairwise, &modulus)
            };
        }

        let self_mask = self.params.prg.eval(self.get_seed());
        let blind = add_vectors(&self.mask, &self_mask, &modulus);
        let masked = add_vectors(self.get_input(), &blind, &modulus);

        debug!("client {}: masked input ready", self.user);
        Ok(MaskedInputMessage {
            user: self.user,
            masked,
        })
    }

    /// Round 4 - Unmasking: opens the held-back envelopes, then hands the
    /// server seed shares for the survivors and key shares for the dropped.
    pub fn unmasking(&mut self, alive: &[u16]) -> Result<UnmaskingMessage> {
        if alive.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "unmasking",
                got: alive.len(),
                need: self.params.threshold,
            });
        }
        if !alive.iter().all(|u| self.round2.contains(u)) {
            return Err(ProtocolError::invalid(
                "alive set contains a peer that never shared keys",
            ));
        }
        self.round4 = alive.to_vec();

        let eshares = std::mem::take(&mut self.eshares)
            .ok_or_else(|| ProtocolError::misuse("unmasking before masked input collection"))?;
        for (&vuser, envelope) in &eshares {
            let ckey = self
                .ckeys
                .get(&vuser)
                .ok_or_else(|| ProtocolError::invalid("share from an unregistered peer"))?;
            let message = EncryptionKey::new(ckey).decrypt(envelope)?;
            let (u, v, kvalue, bvalue) = decode_masking_share(&message)?;
            if v != self.user || u != vuser {
                return Err(ProtocolError::auth("invalid encrypted message"));
            }
            self.seed_shares.insert(
                vuser,
                Share {
                    idx: self.user,
                    value: self.params.ss_seed.field().element(bvalue),
                },
            );
            self.key_shares.insert(
                vuser,
                Share {
                    idx: self.user,
                    value: self.params.ss_key.field().element(kvalue),
                },
            );
        }

        let mut seed_shares = HashMap::new();
        let mut key_shares = HashMap::new();
        for &vuser in &self.round2 {
            if self.round4.contains(&vuser) {
                let share = self
                    .seed_shares
                    .get(&vuser)
                    .ok_or_else(|| ProtocolError::invalid("no seed share for an alive peer"))?;
                seed_shares.insert(vuser, share.clone());
            } else {
                let share = self
                    .key_shares
                    .get(&vuser)
                    .ok_or_else(|| ProtocolError::invalid("no key share for a dropped peer"))?;
                key_shares.insert(vuser, share.clone());
            }
        }

        Ok(UnmaskingMessage {
            user: self.user,
            key_shares,
            seed_shares,
        })
    }
}
