use std::collections::HashMap;
use std::ops::Add;

use num_bigint::{BigInt, RandBigInt};
use num_integer::Integer;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::buildingblocks::utils::factorial;
use crate::error::{ProtocolError, Result};

/// A share of an integer secret held by the user at index `idx`. The value is
/// a signed bignum; nothing is ever reduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IShare {
    pub idx: u16,
    pub value: BigInt,
}

impl<'a, 'b> Add<&'b IShare> for &'a IShare {
    type Output = IShare;

    fn add(self, rhs: &'b IShare) -> IShare {
        assert_eq!(self.idx, rhs.idx, "adding shares of different indices");
        IShare {
            idx: self.idx,
            value: &self.value + &rhs.value,
        }
    }
}

/// Shamir's t-out-of-n sharing over the integers, for secrets that live in
/// `[-2^bitlength, 2^bitlength]` rather than in a field.
///
/// The secret is scaled by Delta = |U|! at sharing time so that Lagrange
/// interpolation never leaves the integers: every Lagrange denominator
/// divides Delta, and reconstruction divides the scaled result by Delta^2.
/// Coefficients carry `sigma` extra bits of statistical hiding on top of the
/// secret and Delta^2 widths, so truncating anywhere would silently destroy
/// correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Isss {
    bitlength: usize,
    sigma: usize,
}

impl Isss {
    pub fn new(bitlength: usize, sigma: usize) -> Self {
        Isss { bitlength, sigma }
    }

    /// Shares `secret` among `users` with reconstruction threshold `t`. All
    /// `t - 1` non-constant coefficients are drawn as signed integers of the
    /// full coefficient width.
    pub fn share(&self, secret: &BigInt, t: usize, users: &[u16]) -> Vec<IShare> {
        let delta = factorial(users.len());
        let bits = self.bitlength + 2 * delta.bits() as usize + self.sigma;
        let nbytes = bits / 8;

        let mut rng = OsRng;
        let mut coeffs: Vec<BigInt> = Vec::with_capacity(t);
        for _ in 0..t - 1 {
            let magnitude: BigInt = rng.gen_biguint(nbytes as u64 * 8).into();
            let coeff = if rng.gen::<bool>() { -magnitude } else { magnitude };
            coeffs.push(coeff);
        }
        coeffs.push(secret * &delta);

        users
            .iter()
            .map(|&i| {
                let idx = BigInt::from(i);
                let mut value = BigInt::from(0u32);
                for coeff in &coeffs {
                    value = &idx * &value + coeff;
                }
                IShare { idx: i, value }
            })
            .collect()
    }

    /// Integer Lagrange coefficients `Delta * N_j / D_j` keyed by share
    /// index; exact divisions because every `D_j` divides Delta.
    pub fn lagrange(&self, shares: &[IShare], delta: &BigInt) -> Result<HashMap<u16, BigInt>> {
        let indices = Self::distinct_indices(shares)?;
        let mut coefs = HashMap::with_capacity(indices.len());
        for &x_j in &indices {
            let mut numerator = BigInt::from(1u32);
            let mut denominator = BigInt::from(1u32);
            for &x_m in &indices {
                if x_m != x_j {
                    numerator *= BigInt::from(x_m);
                    denominator *= BigInt::from(x_m) - BigInt::from(x_j);
                }
            }
            coefs.insert(x_j, (delta * numerator).div_floor(&denominator));
        }
        Ok(coefs)
    }

    /// Reconstructs the secret from at least `t` shares.
    pub fn recon(
        &self,
        shares: &[IShare],
        t: usize,
        delta: &BigInt,
        lagcoefs: Option<&HashMap<u16, BigInt>>,
    ) -> Result<BigInt> {
        if shares.len() < t {
            return Err(ProtocolError::ThresholdNotMet {
                step: "integer share reconstruction",
                got: shares.len(),
                need: t,
            });
        }
        let computed;
        let coefs = match lagcoefs {
            Some(c) => c,
            None => {
                computed = self.lagrange(shares, delta)?;
                &computed
            }
        };

        let mut result = BigInt::from(0u32);
        for share in shares {
            let coef = coefs
                .get(&share.idx)
                .ok_or_else(|| ProtocolError::invalid("share index missing a coefficient"))?;
            result += &share.value * coef;
        }
        Ok(result.div_floor(&(delta * delta)))
    }

    /// Reconstructs every coordinate of a shared vector, computing the
    /// Lagrange coefficients once.
    pub fn recon_vector(
        &self,
        shares: &[Vec<IShare>],
        t: usize,
        delta: &BigInt,
    ) -> Result<Vec<BigInt>> {
        let len = match shares.first() {
            Some(v) => v.len(),
            None => return Err(ProtocolError::invalid("empty list of shares")),
        };
        for v in shares {
            if v.len() != len {
                return Err(ProtocolError::invalid(
                    "vector shares do not have the same size",
                ));
            }
        }

        let mut lagcoefs = None;
        let mut recon = Vec::with_capacity(len);
        for counter in 0..len {
            let elementshares: Vec<IShare> =
                shares.iter().map(|v| v[counter].clone()).collect();
            if lagcoefs.is_none() {
                lagcoefs = Some(self.lagrange(&elementshares, delta)?);
            }
            recon.push(self.recon(&elementshares, t, delta, lagcoefs.as_ref())?);
        }
        Ok(recon)
    }

    fn distinct_indices(shares: &[IShare]) -> Result<Vec<u16>> {
        let mut indices = Vec::with_capacity(shares.len());
        for s in shares {
            if indices.contains(&s.idx) {
                return Err(ProtocolError::invalid("duplicate share"));
            }
            indices.push(s.idx);
        }
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    #[test]
    fn test_reconstruct_exact() {
        let iss = Isss::new(64, 32);
        let users: Vec<u16> = (1..=5).collect();
        let delta = factorial(5);
        for secret in [
            BigInt::from(0u32),
            BigInt::from(1u32) << 60,
            -(BigInt::from(7777u32)),
        ] {
            let shares = iss.share(&secret, 3, &users);
            assert_eq!(shares.len(), 5);
            assert_eq!(iss.recon(&shares[..3], 3, &delta, None).unwrap(), secret);
            assert_eq!(iss.recon(&shares[1..], 3, &delta, None).unwrap(), secret);
        }
    }

    #[test]
    fn test_large_secret_width() {
        // the secret space of a TJL key: signed, twice the modulus width
        let iss = Isss::new(256, 128);
        let users: Vec<u16> = (1..=4).collect();
        let delta = factorial(4);
        let secret: BigInt = -(BigInt::from(OsRng.gen_biguint(256)));
        let shares = iss.share(&secret, 2, &users);
        assert_eq!(
            iss.recon(&shares[2..], 2, &delta, None).unwrap(),
            secret
        );
    }

    #[test]
    fn test_too_few_shares() {
        let iss = Isss::new(64, 32);
        let users: Vec<u16> = (1..=4).collect();
        let shares = iss.share(&BigInt::from(5u32), 3, &users);
        assert!(matches!(
            iss.recon(&shares[..2], 3, &factorial(4), None),
            Err(ProtocolError::ThresholdNotMet { .. })
        ));
    }

    #[test]
    fn test_duplicate_share_rejected() {
        let iss = Isss::new(64, 32);
        let users: Vec<u16> = (1..=3).collect();
        let shares = iss.share(&BigInt::from(5u32), 2, &users);
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert!(iss.recon(&dup, 2, &factorial(3), None).is_err());
    }

    #[test]
    fn test_vector_reconstruction() {
        let iss = Isss::new(64, 32);
        let users: Vec<u16> = (1..=4).collect();
        let delta = factorial(4);
        let secrets = [BigInt::from(10u32), BigInt::zero(), -BigInt::from(3u32)];

        // per-user vectors of shares, one coordinate per secret
        let per_secret: Vec<Vec<IShare>> =
            secrets.iter().map(|s| iss.share(s, 3, &users)).collect();
        let per_user: Vec<Vec<IShare>> = (0..3)
            .map(|u| per_secret.iter().map(|s| s[u].clone()).collect())
            .collect();

        let recon = iss.recon_vector(&per_user, 3, &delta).unwrap();
        assert_eq!(recon, secrets.to_vec());
    }

    #[test]
    fn test_summed_shares_reconstruct_sum() {
        let iss = Isss::new(64, 32);
        let users: Vec<u16> = (1..=3).collect();
        let delta = factorial(3);
        let a = BigInt::from(1234u32);
        let b = -BigInt::from(999u32);
        let sa = iss.share(&a, 2, &users);
        let sb = iss.share(&b, 2, &users);
        let summed: Vec<IShare> = sa.iter().zip(&sb).map(|(x, y)| x + y).collect();
        // the sum is scaled by the same Delta, so it reconstructs directly
        assert_eq!(iss.recon(&summed[..2], 2, &delta, None).unwrap(), &a + &b);
    }
}
