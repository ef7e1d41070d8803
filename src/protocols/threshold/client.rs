use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;
use nalgebra::DVector;
use num_bigint::{BigInt, RandBigInt};
use num_traits::Zero;
use paste::paste;
use rand::rngs::OsRng;

use crate::buildingblocks::aead::{EncryptedMessage, EncryptionKey};
use crate::buildingblocks::integer_shamir::IShare;
use crate::buildingblocks::joye_libert::UserKey;
use crate::buildingblocks::key_agreement::{public_key_from_bytes, Kas};
use crate::buildingblocks::prg::PRG_SECURITY;
use crate::buildingblocks::shamir::Share;
use crate::buildingblocks::utils::add_vectors;
use crate::error::{ProtocolError, Result};
use crate::generate_getters_and_setters;
use crate::protocols::messages::{
    decode_key_share, decode_seed_share, encode_key_share, encode_seed_share, ConstructMessage,
    EncryptMessage, KeySetupMessage, RegisterMessage,
};
use crate::protocols::params::ProtocolParams;

/// A client of the threshold-JL aggregation protocol.
///
/// Long-lived state (the protection key, channel keys, and the integer
/// shares of every peer's key) is established once in the setup phase and
/// survives round rollover; everything else is per round.
pub struct Client {
    pub user: u16,
    params: ProtocolParams,
    step: u64,
    key: Option<UserKey>,
    input: Option<DVector<BigInt>>,
    ckeys: HashMap<u16, BigInt>,
    registered: Vec<u16>,
    alive: Vec<u16>,
    seed_shares: HashMap<u16, Share>,
    key_shares: HashMap<u16, IShare>,
    kas: Kas,
    kac: Kas,
}

generate_getters_and_setters! {
    Client, user,
    key: UserKey,
    input: DVector<BigInt>
}

impl Client {
    pub fn new(user: u16, params: ProtocolParams) -> Self {
        Client {
            user,
            params,
            step: 0,
            key: None,
            input: None,
            ckeys: HashMap::new(),
            registered: Vec::new(),
            alive: Vec::new(),
            seed_shares: HashMap::new(),
            key_shares: HashMap::new(),
            kas: Kas::new(),
            kac: Kas::new(),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn alive(&self) -> &[u16] {
        &self.alive
    }

    /// Starts a new aggregation round: the period advances, per-round state
    /// is dropped, keys and key shares are kept.
    pub fn new_fl_step(&mut self) {
        self.step += 1;
        self.alive.clear();
        self.seed_shares.clear();
        self.input = None;
    }

    /// Setup - Register: generates the two ephemeral key pairs and announces
    /// them to the server.
    pub fn setup_register(&mut self) -> Result<RegisterMessage> {
        self.kas.generate();
        self.kac.generate();
        self.registered = vec![self.user];
        Ok(RegisterMessage {
            user: self.user,
            pk_s: self.kas.public_bytes(),
            pk_c: self.kac.public_bytes(),
        })
    }

    /// Setup - KeySetup: derives the channel keys and the protection key
    /// from the peer directories, then shares the protection key over the
    /// integers, one encrypted share per peer.
    pub fn setup_keysetup(
        &mut self,
        alldhpks: &BTreeMap<u16, Vec<u8>>,
        alldhpkc: &BTreeMap<u16, Vec<u8>>,
    ) -> Result<KeySetupMessage> {
        if alldhpks.keys().ne(alldhpkc.keys()) {
            return Err(ProtocolError::invalid("mismatched peer directories"));
        }
        if alldhpkc.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "setup_keysetup",
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

        let mut key = BigInt::zero();
        for (&vuser, pk_c) in alldhpkc {
            if vuser == self.user {
                continue;
            }
            self.registered.push(vuser);

            self.ckeys
                .insert(vuser, self.kac.agree(&public_key_from_bytes(pk_c)?, 256));

            let sv = self
                .kas
                .agree(&public_key_from_bytes(&alldhpks[&vuser])?, self.params.keysize);
            if vuser > self.user {
                key -= sv;
            } else {
                key += sv;
            }
        }
        self.registered.sort_unstable();
        self.set_key(UserKey::new(self.params.pp.clone(), key));

        let shares =
            self.params
                .tjl
                .sk_share(self.get_key(), self.params.threshold, &self.registered);

        let mut encrypted = HashMap::new();
        for share in shares {
            let vuser = share.idx;
            if vuser == self.user {
                self.key_shares.insert(self.user, share);
                continue;
            }
            let channel = EncryptionKey::new(&self.ckeys[&vuser]);
            let message = encode_key_share(self.user, vuser, &share.value);
            encrypted.insert(vuser, channel.encrypt(&message)?);
        }

        debug!(
            "client {}: key setup with {} registered peers",
            self.user,
            self.registered.len()
        );
        Ok(KeySetupMessage {
            user: self.user,
            shares: encrypted,
        })
    }

    /// Setup - KeySetup (second half): stores the peers' key shares after
    /// checking each envelope's (u, v) tags.
    pub fn setup_keysetup2(&mut self, eshares: &HashMap<u16, EncryptedMessage>) -> Result<()> {
        if eshares.len() + 1 < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "setup_keysetup2",
                got: eshares.len() + 1,
                need: self.params.threshold,
            });
        }

        for (&vuser, envelope) in eshares {
            let ckey = self
                .ckeys
                .get(&vuser)
                .ok_or_else(|| ProtocolError::invalid("share from an unregistered peer"))?;
            let message = EncryptionKey::new(ckey).decrypt(envelope)?;
            let (u, v, value) = decode_key_share(&message)?;
            if v != self.user || u != vuser {
                return Err(ProtocolError::auth("invalid encrypted message"));
            }
            self.key_shares.insert(
                vuser,
                IShare {
                    idx: self.user,
                    value,
                },
            );
        }
        Ok(())
    }

    /// Online - Encrypt: masks the input with a fresh PRG-expanded seed,
    /// protects it for the current period, and shares the seed.
    pub fn online_encrypt(&mut self) -> Result<EncryptMessage> {
        let seed: BigInt = OsRng.gen_biguint(PRG_SECURITY as u64).into();
        let mask = self.params.prg.eval(&seed);
        let masked = add_vectors(self.get_input(), &mask, &self.params.mask_modulus());

        let tau = BigInt::from(self.step);
        let protected =
            self.params
                .tjl
                .protect_vector(&self.params.pp, self.get_key(), &tau, &masked)?;

        let shares = self
            .params
            .ss
            .share(self.params.threshold, self.params.nclients, &seed);

        let mut encrypted = HashMap::new();
        for share in shares {
            let vuser = share.idx;
            if vuser == self.user {
                self.seed_shares.insert(self.user, share);
                continue;
            }
            // shares indexed at users that never registered have no channel
            // to travel over and are discarded
            if let Some(ckey) = self.ckeys.get(&vuser) {
                let channel = EncryptionKey::new(ckey);
                let message = encode_seed_share(self.user, vuser, share.value.value());
                encrypted.insert(vuser, channel.encrypt(&message)?);
            }
        }

        debug!("client {}: input protected for period {}", self.user, self.step);
        Ok(EncryptMessage {
            user: self.user,
            shares: encrypted,
            protected,
        })
    }

    /// Online - Construct: the delivered seed shares define the alive set;
    /// for every dropped peer this client contributes its integer key share
    /// to a protected zero-value.
    pub fn online_construct(
        &mut self,
        eshares: &HashMap<u16, EncryptedMessage>,
    ) -> Result<ConstructMessage> {
        if eshares.len() + 1 < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "online_construct",
                got: eshares.len() + 1,
                need: self.params.threshold,
            });
        }

        self.alive = vec![self.user];
        for (&vuser, envelope) in eshares {
            let ckey = self
                .ckeys
                .get(&vuser)
                .ok_or_else(|| ProtocolError::invalid("share from an unregistered peer"))?;
            let message = EncryptionKey::new(ckey).decrypt(envelope)?;
            let (u, v, value) = decode_seed_share(&message)?;
            if v != self.user || u != vuser {
                return Err(ProtocolError::auth("invalid encrypted message"));
            }
            self.alive.push(vuser);
            self.seed_shares.insert(
                vuser,
                Share {
                    idx: self.user,
                    value: self.params.ss.field().element(value),
                },
            );
        }
        self.alive.sort_unstable();

        let dropped: Vec<u16> = self
            .registered
            .iter()
            .copied()
            .filter(|u| !self.alive.contains(u))
            .collect();

        let recovery = if dropped.is_empty() {
            None
        } else {
            let mut dropshares = Vec::with_capacity(dropped.len());
            for vuser in &dropped {
                let share = self.key_shares.get(vuser).ok_or_else(|| {
                    ProtocolError::invalid("no key share held for a dropped peer")
                })?;
                dropshares.push(share.clone());
            }
            let tau = BigInt::from(self.step);
            debug!(
                "client {}: protecting zero-value for {} dropped peers",
                self.user,
                dropped.len()
            );
            Some(
                self.params
                    .tjl
                    .share_protect(&self.params.pp, &dropshares, &tau)?,
            )
        };

        Ok(ConstructMessage {
            user: self.user,
            seed_shares: self.seed_shares.clone(),
            recovery,
        })
    }
}
