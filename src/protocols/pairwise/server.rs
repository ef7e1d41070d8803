use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use nalgebra::DVector;
use num_bigint::BigInt;
use num_traits::{One, Zero};

use crate::buildingblocks::aead::EncryptedMessage;
use crate::buildingblocks::key_agreement::{public_key_from_bytes, Kas};
use crate::buildingblocks::shamir::Share;
use crate::buildingblocks::utils::{add_vectors, subs_vectors};
use crate::error::{ProtocolError, Result};
use crate::protocols::messages::{
    MaskedInputMessage, MaskingSharesMessage, RegisterMessage, UnmaskingMessage,
};
use crate::protocols::pairwise::PairwiseParams;

/// The aggregator of the mask-pairwise protocol.
///
/// Unmasking needs two reconstructions per round: the self-mask seed of
/// every survivor and the DH secret key of every dropped client, whose
/// pairwise masks the server then recomputes itself.
pub struct Server {
    params: PairwiseParams,
    step: u64,
    round1: Vec<u16>,
    round2: Vec<u16>,
    round3: Vec<u16>,
    round5: Vec<u16>,
    dh_public: BTreeMap<u16, Vec<u8>>,
    masked: BTreeMap<u16, DVector<BigInt>>,
}

impl Server {
    pub fn new(params: PairwiseParams) -> Self {
        Server {
            params,
            step: 1,
            round1: Vec::new(),
            round2: Vec::new(),
            round3: Vec::new(),
            round5: Vec::new(),
            dh_public: BTreeMap::new(),
            masked: BTreeMap::new(),
        }
    }

    pub fn new_fl_step(&mut self) {
        self.step += 1;
        self.round1.clear();
        self.round2.clear();
        self.round3.clear();
        self.round5.clear();
        self.dh_public.clear();
        self.masked.clear();
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn alive(&self) -> &[u16] {
        &self.round3
    }

    /// Round 0 - AdvertiseKeys: collects the public keys and broadcasts the
    /// two directories.
    pub fn advertise_keys(
        &mut self,
        messages: &[RegisterMessage],
    ) -> Result<(BTreeMap<u16, Vec<u8>>, BTreeMap<u16, Vec<u8>>)> {
        let mut pks = BTreeMap::new();
        let mut pkc = BTreeMap::new();
        for m in messages {
            if pks.insert(m.user, m.pk_s.clone()).is_some() {
                return Err(ProtocolError::invalid("duplicate registration"));
            }
            pkc.insert(m.user, m.pk_c.clone());
        }
        self.round1 = pks.keys().copied().collect();
        if self.round1.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "advertise_keys",
                got: self.round1.len(),
                need: self.params.threshold,
            });
        }
        self.dh_public = pks.clone();
        Ok((pks, pkc))
    }

    /// Round 1 - ShareKeys: routes the encrypted share envelopes.
    pub fn share_keys(
        &mut self,
        messages: &[MaskingSharesMessage],
    ) -> Result<HashMap<u16, HashMap<u16, EncryptedMessage>>> {
        if messages.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "share_keys",
                got: messages.len(),
                need: self.params.threshold,
            });
        }
        self.round2.clear();
        let mut dispatch: HashMap<u16, HashMap<u16, EncryptedMessage>> = HashMap::new();
        for m in messages {
            if self.round2.contains(&m.user) {
                return Err(ProtocolError::invalid("duplicate share message"));
            }
            self.round2.push(m.user);
            for (&vuser, envelope) in &m.shares {
                dispatch.entry(vuser).or_default().insert(m.user, envelope.clone());
            }
        }
        self.round2.sort_unstable();
        Ok(dispatch)
    }

    /// Round 2 - MaskedInputCollection: stores the blinded inputs and
    /// returns the alive set for the clients' unmasking round.
    pub fn masked_input_collection(
        &mut self,
        messages: &[MaskedInputMessage],
    ) -> Result<Vec<u16>> {
        self.masked.clear();
        for m in messages {
            if !self.round2.contains(&m.user) {
                return Err(ProtocolError::invalid(
                    "masked input from a peer that never shared keys",
                ));
            }
            if self.masked.insert(m.user, m.masked.clone()).is_some() {
                return Err(ProtocolError::invalid("duplicate masked input"));
            }
        }
        self.round3 = self.masked.keys().copied().collect();
        if self.round3.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "masked_input_collection",
                got: self.round3.len(),
                need: self.params.threshold,
            });
        }
        debug!(
            "server: {} of {} masked inputs collected",
            self.round3.len(),
            self.round2.len()
        );
        Ok(self.round3.clone())
    }

    /// Round 4 - Unmasking: strips the self masks of the survivors and the
    /// pairwise masks of the dropped, and returns the sum vector.
    pub fn unmasking(&mut self, messages: &[UnmaskingMessage]) -> Result<DVector<BigInt>> {
        self.round5 = messages.iter().map(|m| m.user).collect();
        self.round5.sort_unstable();
        if self.round5.len() < self.params.threshold {
            return Err(ProtocolError::ThresholdNotMet {
                step: "unmasking",
                got: self.round5.len(),
                need: self.params.threshold,
            });
        }

        // self-mask seeds of the survivors
        let mut seed_shares: BTreeMap<u16, Vec<Share>> = BTreeMap::new();
        for m in messages {
            for (&owner, share) in &m.seed_shares {
                seed_shares.entry(owner).or_default().push(share.clone());
            }
        }
        let mut lagcoefs = None;
        let mut self_masks = Vec::with_capacity(seed_shares.len());
        for (owner, shares) in &seed_shares {
            if shares.len() < self.params.threshold {
                return Err(ProtocolError::ThresholdNotMet {
                    step: "seed reconstruction",
                    got: shares.len(),
                    need: self.params.threshold,
                });
            }
            if lagcoefs.is_none() {
                lagcoefs = Some(self.params.ss_seed.lagrange(shares)?);
            }
            let seed = self.params.ss_seed.recon(shares, lagcoefs.as_ref())?;
            debug!("server: seed of client {owner} reconstructed");
            self_masks.push(self.params.prg.eval(&seed));
        }

        // DH keys of the dropped
        let mut key_shares: BTreeMap<u16, Vec<Share>> = BTreeMap::new();
        for m in messages {
            for (&owner, share) in &m.key_shares {
                key_shares.entry(owner).or_default().push(share.clone());
            }
        }
        let mut lagcoefs = None;
        let mut recovered: HashMap<u16, Kas> = HashMap::new();
        for (&owner, shares) in &key_shares {
            if shares.len() < self.params.threshold {
                return Err(ProtocolError::ThresholdNotMet {
                    step: "key reconstruction",
                    got: shares.len(),
                    need: self.params.threshold,
                });
            }
            if lagcoefs.is_none() {
                lagcoefs = Some(self.params.ss_key.lagrange(shares)?);
            }
            let scalar = self.params.ss_key.recon(shares, lagcoefs.as_ref())?;
            let mut kas = Kas::new();
            kas.generate_from_bytes(&scalar.to_bytes_be().1)?;
            recovered.insert(owner, kas);
        }

        // recompute the pairwise masks of every dropped client
        let modulus = self.params.mask_modulus();
        let mut dropped_masks = Vec::new();
        for &user in &self.round2 {
            if self.round3.contains(&user) {
                continue;
            }
            let kas = recovered
                .get(&user)
                .ok_or_else(|| ProtocolError::invalid("no key shares for a dropped peer"))?;
            let mut mask = DVector::from_element(self.params.dimension, BigInt::zero());
            for (&vuser, pk_s) in &self.dh_public {
                if vuser == user {
                    continue;
                }
                let sv = kas.agree(&public_key_from_bytes(pk_s)?, self.params.keysize);
                let pairwise = self.params.prg.eval(&sv);
                mask = if vuser > user {
                    subs_vectors(&mask, &pairwise, &modulus)
                } else {
                    add_vectors(&mask, &pairwise, &modulus)
                };
            }
            dropped_masks.push(mask);
        }

        let mut result = DVector::from_element(self.params.dimension, BigInt::zero());
        for masked in self.masked.values() {
            result = add_vectors(&result, masked, &modulus);
        }
        for mask in &dropped_masks {
            result = add_vectors(&result, mask, &modulus);
        }
        for mask in &self_masks {
            result = subs_vectors(&result, mask, &modulus);
        }

        info!(
            "server: aggregated {} inputs with {} dropped clients",
            self.round3.len(),
            dropped_masks.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::pairwise::Client;
    use num_integer::Integer;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn build(dimension: usize, valuesize: usize, t: usize, n: usize) -> (Vec<Client>, Server) {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = PairwiseParams::init(dimension, valuesize, 256, t, n).unwrap();
        let clients = (1..=n as u16)
            .map(|u| Client::new(u, params.clone()))
            .collect();
        (clients, Server::new(params))
    }

    /// One full round; clients in `dropped` go silent after sharing keys.
    fn run_round(
        clients: &mut [Client],
        server: &mut Server,
        inputs: &[DVector<BigInt>],
        dropped: &[u16],
    ) -> DVector<BigInt> {
        for (c, x) in clients.iter_mut().zip(inputs) {
            c.set_input(x.clone());
        }

        let registrations: Vec<RegisterMessage> = clients
            .iter_mut()
            .map(|c| c.advertise_keys().unwrap())
            .collect();
        let (pks, pkc) = server.advertise_keys(&registrations).unwrap();

        let share_msgs: Vec<MaskingSharesMessage> = clients
            .iter_mut()
            .map(|c| c.share_keys(&pks, &pkc).unwrap())
            .collect();
        let mut dispatch = server.share_keys(&share_msgs).unwrap();

        let masked_msgs: Vec<MaskedInputMessage> = clients
            .iter_mut()
            .filter(|c| !dropped.contains(&c.user))
            .map(|c| {
                c.masked_input_collection(&dispatch.remove(&c.user).unwrap())
                    .unwrap()
            })
            .collect();
        let alive = server.masked_input_collection(&masked_msgs).unwrap();

        let unmask_msgs: Vec<UnmaskingMessage> = clients
            .iter_mut()
            .filter(|c| !dropped.contains(&c.user))
            .map(|c| c.unmasking(&alive).unwrap())
            .collect();
        server.unmasking(&unmask_msgs).unwrap()
    }

    fn vector(values: &[u64]) -> DVector<BigInt> {
        DVector::from_vec(values.iter().map(|&v| BigInt::from(v)).collect())
    }

    #[test]
    fn test_round_without_dropout() {
        let (mut clients, mut server) = build(4, 8, 2, 3);
        let inputs = vec![
            vector(&[1, 2, 3, 4]),
            vector(&[5, 6, 7, 8]),
            vector(&[9, 10, 11, 12]),
        ];
        let sum = run_round(&mut clients, &mut server, &inputs, &[]);
        assert_eq!(sum, vector(&[15, 18, 21, 24]));
    }

    #[test]
    fn test_round_with_dropout() {
        let (mut clients, mut server) = build(3, 8, 3, 5);
        let inputs = vec![
            vector(&[1, 0, 0]),
            vector(&[0, 2, 0]),
            vector(&[0, 0, 3]),
            vector(&[4, 4, 4]),
            vector(&[5, 5, 5]),
        ];
        // clients 2 and 5 vanish after sharing keys; the server recovers
        // their pairwise masks from the surviving key shares
        let sum = run_round(&mut clients, &mut server, &inputs, &[2, 5]);
        assert_eq!(sum, vector(&[5, 4, 7]));
        assert_eq!(server.alive(), &[1, 3, 4]);
    }

    #[test]
    fn test_random_inputs_sum_mod_ring() {
        let (mut clients, mut server) = build(50, 16, 4, 5);
        let mut rng = StdRng::seed_from_u64(7);
        let inputs: Vec<DVector<BigInt>> = (0..5)
            .map(|_| DVector::from_fn(50, |_, _| BigInt::from(rng.gen::<u16>())))
            .collect();
        let sum = run_round(&mut clients, &mut server, &inputs, &[]);

        let modulus = BigInt::one() << 19;
        for i in 0..50 {
            let expected: BigInt = inputs.iter().map(|x| &x[i]).sum();
            assert_eq!(sum[i], expected.mod_floor(&modulus));
        }
    }

    #[test]
    fn test_two_rounds_with_fresh_keys() {
        let (mut clients, mut server) = build(2, 8, 2, 3);
        let first = run_round(
            &mut clients,
            &mut server,
            &[vector(&[1, 1]), vector(&[2, 2]), vector(&[3, 3])],
            &[],
        );
        assert_eq!(first, vector(&[6, 6]));

        server.new_fl_step();
        for c in clients.iter_mut() {
            c.new_fl_step();
        }
        let second = run_round(
            &mut clients,
            &mut server,
            &[vector(&[9, 0]), vector(&[0, 9]), vector(&[1, 1])],
            &[3],
        );
        assert_eq!(second, vector(&[9, 9]));
    }
}
