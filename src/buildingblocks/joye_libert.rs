use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DVector;
use num_bigint::{BigInt, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::rngs::OsRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::buildingblocks::full_domain_hash::Fdh;
use crate::buildingblocks::integer_shamir::{IShare, Isss};
use crate::buildingblocks::utils::{getprimeover, invert, powmod};
use crate::buildingblocks::vector_encoding::Ves;
use crate::error::{ProtocolError, Result};

pub const DEFAULT_KEY_SIZE: usize = 2048;
pub const DEFAULT_SIGMA: usize = 128;

/// The public parameters of the scheme: the modulus N, its square, and the
/// full-domain hash H : Z -> Z*_{N^2}. Shared by every party; equality is by
/// modulus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicParam {
    n: BigInt,
    nsquare: BigInt,
    bits: usize,
    fdh: Fdh,
}

impl PublicParam {
    pub fn new(n: BigInt, bits: usize, fdh: Fdh) -> Self {
        let nsquare = &n * &n;
        PublicParam {
            n,
            nsquare,
            bits,
            fdh,
        }
    }

    pub fn n(&self) -> &BigInt {
        &self.n
    }

    pub fn nsquare(&self) -> &BigInt {
        &self.nsquare
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn h(&self, t: &BigInt) -> BigInt {
        self.fdh.hash(t)
    }
}

impl PartialEq for PublicParam {
    fn eq(&self, other: &Self) -> bool {
        self.n == other.n
    }
}

impl fmt::Display for PublicParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.n.to_string();
        write!(
            f,
            "<PublicParam (N={}...{}, {} bits)>",
            &digits[..5.min(digits.len())],
            &digits[digits.len().saturating_sub(5)..],
            self.bits
        )
    }
}

/// A user's protection key: a signed integer of roughly twice the modulus
/// width. Never transmitted in cleartext.
#[derive(Debug, Clone, PartialEq)]
pub struct UserKey {
    pp: PublicParam,
    s: BigInt,
}

impl UserKey {
    pub fn new(pp: PublicParam, s: BigInt) -> Self {
        UserKey { pp, s }
    }

    pub fn s(&self) -> &BigInt {
        &self.s
    }

    /// y = (1 + x N) H(tau)^s mod N^2
    pub fn encrypt(&self, plaintext: &BigInt, tau: &BigInt) -> Result<EncryptedNumber> {
        let pp = &self.pp;
        let nude = (pp.n() * plaintext + BigInt::one()).mod_floor(pp.nsquare());
        let r = powmod(&pp.h(tau), &self.s, pp.nsquare())?;
        Ok(EncryptedNumber {
            ciphertext: (nude * r).mod_floor(pp.nsquare()),
        })
    }

    /// Encrypts a pre-encoded batch vector, multiplexing the period across
    /// batches so every ciphertext uses a distinct hash point.
    pub fn encrypt_vector(&self, batches: &[BigInt], tau: &BigInt) -> Result<Vec<EncryptedNumber>> {
        batches
            .par_iter()
            .enumerate()
            .map(|(c, batch)| self.encrypt(batch, &batch_period(&self.pp, c, tau)))
            .collect()
    }
}

/// The aggregator's key, equal to the negated sum of all user keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerKey {
    pp: PublicParam,
    s: BigInt,
}

impl ServerKey {
    pub fn new(pp: PublicParam, s: BigInt) -> Self {
        ServerKey { pp, s }
    }

    /// V = y H(tau)^{delta^2 s} mod N^2, then the Paillier-style plaintext
    /// extraction with the delta^2 scaling divided back out mod N.
    pub fn decrypt(&self, cipher: &EncryptedNumber, tau: &BigInt, delta: &BigInt) -> Result<BigInt> {
        let pp = &self.pp;
        let delta_sq = delta * delta;
        let v = (&cipher.ciphertext * powmod(&pp.h(tau), &(&delta_sq * &self.s), pp.nsquare())?)
            .mod_floor(pp.nsquare());
        let x = ((v - BigInt::one()).div_floor(pp.n())).mod_floor(pp.n());
        Ok((x * invert(&delta_sq, pp.n())?).mod_floor(pp.n()))
    }

    pub fn decrypt_vector(
        &self,
        ciphers: &[EncryptedNumber],
        tau: &BigInt,
        delta: &BigInt,
    ) -> Result<Vec<BigInt>> {
        ciphers
            .par_iter()
            .enumerate()
            .map(|(c, cipher)| self.decrypt(cipher, &batch_period(&self.pp, c, tau), delta))
            .collect()
    }
}

/// A residue in Z_{N^2}. Ciphertext addition is multiplication mod N^2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedNumber {
    pub ciphertext: BigInt,
}

impl EncryptedNumber {
    pub fn add(&self, other: &EncryptedNumber, pp: &PublicParam) -> EncryptedNumber {
        EncryptedNumber {
            ciphertext: (&self.ciphertext * &other.ciphertext).mod_floor(pp.nsquare()),
        }
    }
}

/// One user's contribution to the recovery of the dropped users' hash term:
/// a protected zero-value per batch, tagged with the holder's share index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryShare {
    pub idx: u16,
    pub values: Vec<EncryptedNumber>,
}

fn batch_period(pp: &PublicParam, counter: usize, tau: &BigInt) -> BigInt {
    (BigInt::from(counter) << (pp.bits() / 2)) | tau
}

/// The Joye-Libert aggregation scheme: Setup, Protect, and Agg.
#[derive(Debug, Clone)]
pub struct Jls {
    nusers: usize,
    ve: Option<Ves>,
}

impl Jls {
    pub fn new(nusers: usize, ve: Option<Ves>) -> Self {
        Jls { nusers, ve }
    }

    /// Generates the modulus, the hash, and the n + 1 keys with
    /// sum(sk_u) + sk_0 = 0.
    pub fn setup(&self, lmbda: usize) -> Result<(PublicParam, ServerKey, BTreeMap<u16, UserKey>)> {
        let mut n = BigInt::zero();
        let mut n_len = 0;
        while n_len != lmbda / 2 {
            let p = getprimeover(lmbda as u64 / 4);
            let mut q = p.clone();
            while q == p {
                q = getprimeover(lmbda as u64 / 4);
            }
            n = &p * &q;
            n_len = n.bits() as usize;
        }

        let fdh = Fdh::new(lmbda, &n * &n);
        let pp = PublicParam::new(n, lmbda / 2, fdh);

        let mut rng = OsRng;
        let mut s0 = BigInt::zero();
        let mut users = BTreeMap::new();
        for i in 1..=self.nusers as u16 {
            let s: BigInt = rng.gen_biguint(2 * n_len as u64).into();
            s0 += &s;
            users.insert(i, UserKey::new(pp.clone(), s));
        }
        let server = ServerKey::new(pp.clone(), -s0);

        Ok((pp, server, users))
    }

    pub fn protect(
        &self,
        pp: &PublicParam,
        sk_u: &UserKey,
        tau: &BigInt,
        x: &BigInt,
    ) -> Result<EncryptedNumber> {
        check_user_key(pp, sk_u)?;
        sk_u.encrypt(x, tau)
    }

    pub fn protect_vector(
        &self,
        pp: &PublicParam,
        sk_u: &UserKey,
        tau: &BigInt,
        x: &DVector<BigInt>,
    ) -> Result<Vec<EncryptedNumber>> {
        check_user_key(pp, sk_u)?;
        let ve = self
            .ve
            .as_ref()
            .ok_or_else(|| ProtocolError::misuse("no vector encoding configured"))?;
        sk_u.encrypt_vector(&ve.encode(x), tau)
    }

    /// Multiplies all ciphertexts and decrypts the sum. Correct only with
    /// every user's ciphertext present.
    pub fn agg(
        &self,
        pp: &PublicParam,
        sk_0: &ServerKey,
        tau: &BigInt,
        ys: &[EncryptedNumber],
    ) -> Result<BigInt> {
        check_server_key(pp, sk_0)?;
        let y = combine(ys, pp)?;
        sk_0.decrypt(&y, tau, &BigInt::one())
    }

    pub fn agg_vector(
        &self,
        pp: &PublicParam,
        sk_0: &ServerKey,
        tau: &BigInt,
        ys: &[Vec<EncryptedNumber>],
    ) -> Result<DVector<BigInt>> {
        check_server_key(pp, sk_0)?;
        let ve = self
            .ve
            .as_ref()
            .ok_or_else(|| ProtocolError::misuse("no vector encoding configured"))?;
        let combined = combine_vectors(ys, pp)?;
        let batches = sk_0.decrypt_vector(&combined, tau, &BigInt::one())?;
        Ok(ve.decode(&batches))
    }
}

/// The threshold variant: the scheme above plus key sharing, zero-value
/// protection by share holders, and Lagrange-in-the-exponent combination, so
/// the aggregate survives dropped users.
#[derive(Debug, Clone)]
pub struct Tjls {
    nusers: usize,
    threshold: usize,
    keysize: usize,
    sigma: usize,
    ve: Ves,
    iss: Isss,
}

impl Tjls {
    pub fn new(nusers: usize, threshold: usize, keysize: usize, ve: Ves) -> Self {
        Tjls {
            nusers,
            threshold,
            keysize,
            sigma: DEFAULT_SIGMA,
            iss: Isss::new(keysize, DEFAULT_SIGMA),
            ve,
        }
    }

    pub fn nusers(&self) -> usize {
        self.nusers
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn sigma(&self) -> usize {
        self.sigma
    }

    pub fn ve(&self) -> &Ves {
        &self.ve
    }

    pub fn setup(&self) -> Result<(PublicParam, ServerKey, BTreeMap<u16, UserKey>)> {
        Jls::new(self.nusers, Some(self.ve.clone())).setup(self.keysize)
    }

    /// Shares sk_u over the integers among `users`.
    pub fn sk_share(&self, sk_u: &UserKey, t: usize, users: &[u16]) -> Vec<IShare> {
        self.iss.share(sk_u.s(), t, users)
    }

    pub fn protect_vector(
        &self,
        pp: &PublicParam,
        sk_u: &UserKey,
        tau: &BigInt,
        x: &DVector<BigInt>,
    ) -> Result<Vec<EncryptedNumber>> {
        check_user_key(pp, sk_u)?;
        sk_u.encrypt_vector(&self.ve.encode(x), tau)
    }

    /// Protects a zero vector under the summed shares of every dropped
    /// user's key, producing this holder's recovery share for period `tau`.
    pub fn share_protect(
        &self,
        pp: &PublicParam,
        dropped_key_shares: &[IShare],
        tau: &BigInt,
    ) -> Result<RecoveryShare> {
        let mut it = dropped_key_shares.iter();
        let first = it
            .next()
            .ok_or_else(|| ProtocolError::invalid("no key shares to protect with"))?;
        let sharesum = it.fold(first.clone(), |acc, s| &acc + s);

        let keyshare = UserKey::new(pp.clone(), sharesum.value);
        let zeros = DVector::from_element(self.ve.vectorsize, BigInt::zero());
        let values = self.protect_vector(pp, &keyshare, tau, &zeros)?;
        Ok(RecoveryShare {
            idx: first.idx,
            values,
        })
    }

    /// Combines at least `t` recovery shares by Lagrange interpolation on
    /// the exponent. `delta` is the factorial of the registered-user count.
    pub fn share_combine(
        &self,
        pp: &PublicParam,
        shares: &[RecoveryShare],
        t: usize,
        delta: &BigInt,
    ) -> Result<Vec<EncryptedNumber>> {
        if shares.len() < t {
            return Err(ProtocolError::ThresholdNotMet {
                step: "recovery share combination",
                got: shares.len(),
                need: t,
            });
        }
        let nbatches = shares[0].values.len();
        for s in shares {
            if s.values.len() != nbatches {
                return Err(ProtocolError::invalid(
                    "recovery shares do not have the same size",
                ));
            }
        }

        // integer Lagrange coefficients, computed once for all batches
        let mut indices = Vec::with_capacity(shares.len());
        for s in shares {
            if indices.contains(&s.idx) {
                return Err(ProtocolError::invalid("duplicate share"));
            }
            indices.push(s.idx);
        }
        let mut coefs = Vec::with_capacity(shares.len());
        for &x_j in &indices {
            let mut numerator = BigInt::one();
            let mut denominator = BigInt::one();
            for &x_m in &indices {
                if x_m != x_j {
                    numerator *= BigInt::from(x_m);
                    denominator *= BigInt::from(x_m) - BigInt::from(x_j);
                }
            }
            coefs.push((delta * numerator).div_floor(&denominator));
        }

        (0..nbatches)
            .into_par_iter()
            .map(|c| {
                let mut result = BigInt::one();
                for (share, coef) in shares.iter().zip(&coefs) {
                    let r = powmod(&share.values[c].ciphertext, coef, pp.nsquare())?;
                    result = (result * r).mod_floor(pp.nsquare());
                }
                Ok(EncryptedNumber { ciphertext: result })
            })
            .collect()
    }

    /// Aggregates the online users' ciphertexts. With a combined zero-value
    /// the alive-user product is raised to Delta^2 and the zero-value folded
    /// in; without one the ciphertexts must cover the whole registered set,
    /// which only the caller can know. `delta` is the factorial of the
    /// registered-user count.
    pub fn agg_vector(
        &self,
        pp: &PublicParam,
        sk_0: &ServerKey,
        tau: &BigInt,
        ys: &[Vec<EncryptedNumber>],
        yzero: Option<&[EncryptedNumber]>,
        delta: &BigInt,
    ) -> Result<DVector<BigInt>> {
        check_server_key(pp, sk_0)?;
        if ys.is_empty() {
            return Err(ProtocolError::invalid("no protected inputs to aggregate"));
        }

        let mut combined = combine_vectors(ys, pp)?;
        let delta_used = match yzero {
            None => BigInt::one(),
            Some(yzero) => {
                if yzero.len() != combined.len() {
                    return Err(ProtocolError::invalid("bad zero-value vector length"));
                }
                let delta_sq = delta * delta;
                let recovered = combined
                    .par_iter()
                    .zip(yzero)
                    .map(|(y, yz)| {
                        let raised = powmod(&y.ciphertext, &delta_sq, pp.nsquare())?;
                        Ok(EncryptedNumber { ciphertext: raised }.add(yz, pp))
                    })
                    .collect::<Result<Vec<_>>>()?;
                combined = recovered;
                delta.clone()
            }
        };

        let batches = sk_0.decrypt_vector(&combined, tau, &delta_used)?;
        Ok(self.ve.decode(&batches))
    }
}

fn check_user_key(pp: &PublicParam, sk_u: &UserKey) -> Result<()> {
    if &sk_u.pp != pp {
        return Err(ProtocolError::invalid("bad user key"));
    }
    Ok(())
}

fn check_server_key(pp: &PublicParam, sk_0: &ServerKey) -> Result<()> {
    if &sk_0.pp != pp {
        return Err(ProtocolError::invalid("bad server key"));
    }
    Ok(())
}

fn combine(ys: &[EncryptedNumber], pp: &PublicParam) -> Result<EncryptedNumber> {
    let mut it = ys.iter();
    let first = it
        .next()
        .ok_or_else(|| ProtocolError::invalid("no protected inputs to aggregate"))?;
    Ok(it.fold(first.clone(), |acc, y| acc.add(y, pp)))
}

/// Per-batch products of all users' ciphertext vectors.
fn combine_vectors(ys: &[Vec<EncryptedNumber>], pp: &PublicParam) -> Result<Vec<EncryptedNumber>> {
    let nbatches = ys
        .first()
        .ok_or_else(|| ProtocolError::invalid("no protected inputs to aggregate"))?
        .len();
    for y in ys {
        if y.len() != nbatches {
            return Err(ProtocolError::invalid(
                "attempting to aggregate protected vectors of different sizes",
            ));
        }
    }
    Ok((0..nbatches)
        .map(|c| {
            let mut acc = ys[0][c].clone();
            for y in &ys[1..] {
                acc = acc.add(&y[c], pp);
            }
            acc
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildingblocks::utils::{add_vectors, factorial};

    const TEST_KEY_SIZE: usize = 256;

    fn test_ve(nusers: usize) -> Ves {
        // plaintext slot of bits(N)/2, headroom for nusers additions
        Ves::new(TEST_KEY_SIZE / 4, nusers, 8, 6)
    }

    #[test]
    fn test_setup_key_sum_is_zero() {
        let jl = Jls::new(3, None);
        let (pp, server, users) = jl.setup(TEST_KEY_SIZE).unwrap();
        let mut total = server.s.clone();
        for sk in users.values() {
            total += sk.s();
        }
        assert!(total.is_zero());
        // the key-sum zero property on the exponent
        for tau in [0u64, 1, 99] {
            let tau = BigInt::from(tau);
            let h = pp.h(&tau);
            let mut acc = powmod(&h, &server.s, pp.nsquare()).unwrap();
            for sk in users.values() {
                acc = (acc * powmod(&h, sk.s(), pp.nsquare()).unwrap()).mod_floor(pp.nsquare());
            }
            assert!(acc.is_one());
        }
    }

    #[test]
    fn test_modulus_has_requested_size() {
        let jl = Jls::new(2, None);
        let (pp, _, _) = jl.setup(TEST_KEY_SIZE).unwrap();
        assert_eq!(pp.n().bits() as usize, TEST_KEY_SIZE / 2);
        assert_eq!(pp.bits(), TEST_KEY_SIZE / 2);
    }

    #[test]
    fn test_scalar_protect_and_agg() {
        let jl = Jls::new(3, None);
        let (pp, server, users) = jl.setup(TEST_KEY_SIZE).unwrap();
        let tau = BigInt::from(7u32);
        let inputs = [13u32, 0, 2000];
        let ys: Vec<EncryptedNumber> = users
            .values()
            .zip(inputs)
            .map(|(sk, x)| jl.protect(&pp, sk, &tau, &BigInt::from(x)).unwrap())
            .collect();
        let sum = jl.agg(&pp, &server, &tau, &ys).unwrap();
        assert_eq!(sum, BigInt::from(2013u32));
    }

    #[test]
    fn test_vector_protect_and_agg() {
        let nusers = 3;
        let jl = Jls::new(nusers, Some(test_ve(nusers)));
        let (pp, server, users) = jl.setup(TEST_KEY_SIZE).unwrap();
        let tau = BigInt::from(1u32);

        let mut expected = DVector::from_element(6, BigInt::zero());
        let mut ys = Vec::new();
        for (i, sk) in users.values().enumerate() {
            let x = DVector::from_fn(6, |j, _| BigInt::from((i * 10 + j) as u32));
            expected = add_vectors(&expected, &x, &(BigInt::one() << 16));
            ys.push(jl.protect_vector(&pp, sk, &tau, &x).unwrap());
        }
        let sum = jl.agg_vector(&pp, &server, &tau, &ys).unwrap();
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_threshold_agg_with_dropout() {
        let nusers = 4;
        let threshold = 3;
        let tjl = Tjls::new(nusers, threshold, TEST_KEY_SIZE, test_ve(nusers));
        let (pp, server, users) = tjl.setup().unwrap();
        let all: Vec<u16> = users.keys().copied().collect();
        let delta = factorial(nusers);
        let tau = BigInt::from(3u32);

        // every user shares its key, keyed by owner; user 2 then drops
        let mut shared_keys: BTreeMap<u16, Vec<IShare>> = BTreeMap::new();
        for (&u, sk) in &users {
            shared_keys.insert(u, tjl.sk_share(sk, threshold, &all));
        }

        let dropped: u16 = 2;
        let mut ys = Vec::new();
        let mut expected = DVector::from_element(6, BigInt::zero());
        for (&u, sk) in &users {
            if u == dropped {
                continue;
            }
            let x = DVector::from_fn(6, |j, _| BigInt::from(u as u32 + j as u32));
            expected = add_vectors(&expected, &x, &(BigInt::one() << 16));
            ys.push(tjl.protect_vector(&pp, sk, &tau, &x).unwrap());
        }

        // survivors protect a zero value with their share of the dropped key
        let mut recovery = Vec::new();
        for &u in all.iter().filter(|&&u| u != dropped) {
            let share = shared_keys[&dropped]
                .iter()
                .find(|s| s.idx == u)
                .unwrap()
                .clone();
            recovery.push(tjl.share_protect(&pp, &[share], &tau).unwrap());
        }

        let yzero = tjl.share_combine(&pp, &recovery, threshold, &delta).unwrap();
        let sum = tjl
            .agg_vector(&pp, &server, &tau, &ys, Some(&yzero), &delta)
            .unwrap();
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_ciphertexts_are_blinded() {
        let jl = Jls::new(2, None);
        let (pp, _, users) = jl.setup(TEST_KEY_SIZE).unwrap();
        let x = BigInt::from(5u32);
        let tau = BigInt::from(9u32);

        // the hash term hides the plaintext encoding
        let y = jl.protect(&pp, &users[&1], &tau, &x).unwrap();
        let nude = (pp.n() * &x + BigInt::one()).mod_floor(pp.nsquare());
        assert_ne!(y.ciphertext, nude);

        // different keys and different periods give unrelated ciphertexts
        let other_key = jl.protect(&pp, &users[&2], &tau, &x).unwrap();
        assert_ne!(y, other_key);
        let other_period = jl
            .protect(&pp, &users[&1], &BigInt::from(10u32), &x)
            .unwrap();
        assert_ne!(y, other_period);
    }

    #[test]
    fn test_share_combine_threshold_enforced() {
        let nusers = 4;
        let threshold = 3;
        let tjl = Tjls::new(nusers, threshold, TEST_KEY_SIZE, test_ve(nusers));
        let (pp, _, users) = tjl.setup().unwrap();
        let all: Vec<u16> = users.keys().copied().collect();
        let tau = BigInt::one();

        let shares = tjl.sk_share(&users[&1], threshold, &all);
        let recovery: Vec<RecoveryShare> = shares[..2]
            .iter()
            .map(|s| {
                let held = IShare {
                    idx: s.idx,
                    value: s.value.clone(),
                };
                tjl.share_protect(&pp, &[held], &tau).unwrap()
            })
            .collect();
        assert!(matches!(
            tjl.share_combine(&pp, &recovery, threshold, &factorial(nusers)),
            Err(ProtocolError::ThresholdNotMet { .. })
        ));
    }
}
