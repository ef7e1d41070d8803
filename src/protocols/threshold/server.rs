use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use nalgebra::DVector;
use num_bigint::BigInt;
use num_traits::{One, Zero};

use crate::buildingblocks::aead::EncryptedMessage;
use crate::buildingblocks::joye_libert::{EncryptedNumber, RecoveryShare, ServerKey};
use crate::buildingblocks::shamir::Share;
use crate::buildingblocks::utils::{factorial, subs_vectors};
use crate::error::{ProtocolError, Result};
use crate::protocols::messages::{
    ConstructMessage, EncryptMessage, KeySetupMessage, RegisterMessage,
};
use crate::protocols::params::ProtocolParams;

/// The aggregator of the threshold-JL protocol.
///
/// It routes encrypted share envelopes between clients without opening them,
/// records who is still alive at each step, and decrypts only the aggregated
/// ciphertext. Its protection key is zero: the pairwise-derived user keys
/// already cancel.
pub struct Server {
    params: ProtocolParams,
    step: u64,
    key: ServerKey,
    registered: Vec<u16>,
    alive: Vec<u16>,
    protected: Vec<Vec<EncryptedNumber>>,
    delta: BigInt,
}

impl Server {
    pub fn new(params: ProtocolParams) -> Self {
        let key = ServerKey::new(params.pp.clone(), BigInt::zero());
        Server {
            params,
            step: 0,
            key,
            registered: Vec::new(),
            alive: Vec::new(),
            protected: Vec::new(),
            delta: BigInt::one(),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn alive(&self) -> &[u16] {
        &self.alive
    }

    /// Starts a new aggregation round; registration state and Delta persist.
    pub fn new_fl_step(&mut self) {
        self.step += 1;
        self.alive.clear();
        self.protected.clear();
    }

    /// Setup - Register: collects the clients' public keys and broadcasts
    /// the two peer directories back.
    pub fn setup_register(
        &mut self,
        messages: &[RegisterMessage],
    ) -> Result<(BTreeMap<u16, Vec<u8>>, BTreeMap<u16, Vec<u8>>)> {
        if messages.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "setup_register",
                got: messages.len(),
                need: self.params.threshold,
            });
        }
        let mut pks = BTreeMap::new();
        let mut pkc = BTreeMap::new();
        for m in messages {
            if pks.insert(m.user, m.pk_s.clone()).is_some() {
                return Err(ProtocolError::invalid("duplicate registration"));
            }
            pkc.insert(m.user, m.pk_c.clone());
        }
        Ok((pks, pkc))
    }

    /// Setup - KeySetup: transposes the encrypted key-share maps so every
    /// client receives the shares addressed to it, and fixes the registered
    /// set together with Delta = |U|!.
    pub fn setup_keysetup(
        &mut self,
        messages: &[KeySetupMessage],
    ) -> Result<HashMap<u16, HashMap<u16, EncryptedMessage>>> {
        if messages.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "setup_keysetup",
                got: messages.len(),
                need: self.params.threshold,
            });
        }

        self.registered.clear();
        let mut dispatch: HashMap<u16, HashMap<u16, EncryptedMessage>> = HashMap::new();
        for m in messages {
            if self.registered.contains(&m.user) {
                return Err(ProtocolError::invalid("duplicate key setup message"));
            }
            self.registered.push(m.user);
            for (&vuser, envelope) in &m.shares {
                dispatch.entry(vuser).or_default().insert(m.user, envelope.clone());
            }
        }
        self.registered.sort_unstable();
        self.delta = factorial(self.registered.len());

        info!(
            "server: {} clients registered, delta = {}!",
            self.registered.len(),
            self.registered.len()
        );
        Ok(dispatch)
    }

    /// Online - Encrypt: records the alive set and the protected inputs,
    /// and routes the encrypted seed shares to their recipients.
    pub fn online_encrypt(
        &mut self,
        messages: &[EncryptMessage],
    ) -> Result<HashMap<u16, HashMap<u16, EncryptedMessage>>> {
        if messages.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "online_encrypt",
                got: messages.len(),
                need: self.params.threshold,
            });
        }

        let mut ordered: Vec<&EncryptMessage> = messages.iter().collect();
        ordered.sort_unstable_by_key(|m| m.user);

        self.alive.clear();
        self.protected.clear();
        let mut dispatch: HashMap<u16, HashMap<u16, EncryptedMessage>> = HashMap::new();
        for m in ordered {
            if self.alive.contains(&m.user) {
                return Err(ProtocolError::invalid("duplicate protected input"));
            }
            self.alive.push(m.user);
            self.protected.push(m.protected.clone());
            for (&vuser, envelope) in &m.shares {
                dispatch.entry(vuser).or_default().insert(m.user, envelope.clone());
            }
        }

        debug!(
            "server: period {}, {} of {} clients alive",
            self.step,
            self.alive.len(),
            self.registered.len()
        );
        Ok(dispatch)
    }

    /// Online - Construct: reconstructs every alive client's mask seed,
    /// combines the recovery shares when users dropped, aggregates, and
    /// unmasks the sum vector.
    pub fn online_construct(&mut self, messages: &[ConstructMessage]) -> Result<DVector<BigInt>> {
        if messages.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "online_construct",
                got: messages.len(),
                need: self.params.threshold,
            });
        }

        // transpose to per-owner share lists
        let mut per_owner: BTreeMap<u16, Vec<Share>> = BTreeMap::new();
        for m in messages {
            for (&owner, share) in &m.seed_shares {
                per_owner.entry(owner).or_default().push(share.clone());
            }
        }

        // the share index sets coincide across owners, so the Lagrange
        // coefficients are computed once
        let mut lagcoefs = None;
        let mut masks = Vec::with_capacity(per_owner.len());
        for (owner, shares) in &per_owner {
            if shares.len() < self.params.threshold {
                return Err(ProtocolError::ThresholdNotMet {
                    step: "seed reconstruction",
                    got: shares.len(),
                    need: self.params.threshold,
                });
            }
            if lagcoefs.is_none() {
                lagcoefs = Some(self.params.ss.lagrange(shares)?);
            }
            let seed = self.params.ss.recon(shares, lagcoefs.as_ref())?;
            debug!("server: seed of client {owner} reconstructed");
            masks.push(self.params.prg.eval(&seed));
        }

        let recovery: Vec<RecoveryShare> =
            messages.iter().filter_map(|m| m.recovery.clone()).collect();
        let tau = BigInt::from(self.step);
        let yzero = if recovery.is_empty() {
            if self.alive != self.registered {
                return Err(ProtocolError::misuse(
                    "missing user inputs and no protected zero-value",
                ));
            }
            None
        } else {
            Some(self.params.tjl.share_combine(
                &self.params.pp,
                &recovery,
                self.params.threshold,
                &self.delta,
            )?)
        };

        let mut sum = self.params.tjl.agg_vector(
            &self.params.pp,
            &self.key,
            &tau,
            &self.protected,
            yzero.as_deref(),
            &self.delta,
        )?;

        let modulus = self.params.mask_modulus();
        for mask in &masks {
            sum = subs_vectors(&sum, mask, &modulus);
        }

        info!(
            "server: period {} aggregated over {} clients",
            self.step,
            self.alive.len()
        );
        Ok(sum)
    }
}
