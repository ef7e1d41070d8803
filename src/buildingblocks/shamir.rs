use std::collections::HashMap;
use std::ops::Add;

use num_bigint::BigInt;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::buildingblocks::field::{FieldElement, PrimeField};
use crate::error::{ProtocolError, Result};

/// A share of a secret held by the user at index `idx`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub idx: u16,
    pub value: FieldElement,
}

impl<'a, 'b> Add<&'b Share> for &'a Share {
    type Output = Share;

    fn add(self, rhs: &'b Share) -> Share {
        assert_eq!(self.idx, rhs.idx, "adding shares of different indices");
        Share {
            idx: self.idx,
            value: &self.value + &rhs.value,
        }
    }
}

/// Shamir's t-out-of-n secret sharing over a prime field sized to the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sss {
    field: PrimeField,
    bitlength: usize,
}

impl Sss {
    pub fn new(bitlength: usize) -> Result<Self> {
        Ok(Sss {
            field: PrimeField::for_secret_bits(bitlength)?,
            bitlength,
        })
    }

    pub fn field(&self) -> &PrimeField {
        &self.field
    }

    /// Shares `secret` among users `1..=n` with reconstruction threshold `t`.
    pub fn share(&self, t: usize, n: usize, secret: &BigInt) -> Vec<Share> {
        // Coefficients a_{t-1} .. a_1 first, the secret last, so evaluation
        // is a single Horner pass.
        let mut rng = OsRng;
        let mut coeffs = Vec::with_capacity(t);
        for _ in 0..t - 1 {
            let mut bytes = vec![0u8; self.bitlength / 8];
            rng.fill_bytes(&mut bytes);
            coeffs.push(self.field.element_from_bytes(&bytes));
        }
        coeffs.push(self.field.element(secret.clone()));

        (1..=n as u16)
            .map(|i| {
                let idx = self.field.element(BigInt::from(i));
                let mut value = self.field.zero();
                for coeff in &coeffs {
                    value = &(&idx * &value) + coeff;
                }
                Share { idx: i, value }
            })
            .collect()
    }

    /// Computes the Lagrange coefficients for a set of share indices, keyed
    /// by user index. Rejects duplicate indices.
    pub fn lagrange(&self, shares: &[Share]) -> Result<HashMap<u16, FieldElement>> {
        let mut indices = Vec::with_capacity(shares.len());
        for s in shares {
            if indices.contains(&s.idx) {
                return Err(ProtocolError::invalid("duplicate share"));
            }
            indices.push(s.idx);
        }

        let mut coefs = HashMap::with_capacity(shares.len());
        for &x_j in &indices {
            let mut numerator = self.field.one();
            let mut denominator = self.field.one();
            for &x_m in &indices {
                if x_m != x_j {
                    let m = self.field.element(BigInt::from(x_m));
                    numerator = &numerator * &m;
                    denominator = &denominator * &(&m - &self.field.element(BigInt::from(x_j)));
                }
            }
            coefs.insert(x_j, &numerator * &denominator.inverse()?);
        }
        Ok(coefs)
    }

    /// Reconstructs the secret from shares, computing Lagrange coefficients
    /// unless the caller already has them. Needs `t` shares for a correct
    /// answer; that bound is enforced by the protocol layer, not here.
    pub fn recon(
        &self,
        shares: &[Share],
        lagcoefs: Option<&HashMap<u16, FieldElement>>,
    ) -> Result<BigInt> {
        let computed;
        let coefs = match lagcoefs {
            Some(c) => c,
            None => {
                computed = self.lagrange(shares)?;
                &computed
            }
        };

        let mut result = self.field.zero();
        for share in shares {
            let coef = coefs
                .get(&share.idx)
                .ok_or_else(|| ProtocolError::invalid("share index missing a coefficient"))?;
            result = &result + &(&share.value * coef);
        }
        Ok(result.into_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::RandBigInt;

    #[test]
    fn test_share_and_reconstruct() {
        let ss = Sss::new(128).unwrap();
        let secret = OsRng.gen_biguint(128).into();
        let shares = ss.share(3, 5, &secret);
        assert_eq!(shares.len(), 5);

        // any t shares reconstruct
        assert_eq!(ss.recon(&shares[..3], None).unwrap(), secret);
        assert_eq!(ss.recon(&shares[2..], None).unwrap(), secret);
        assert_eq!(ss.recon(&shares, None).unwrap(), secret);
    }

    #[test]
    fn test_precomputed_lagrange() {
        let ss = Sss::new(128).unwrap();
        let secret = BigInt::from(123456789u64);
        let shares = ss.share(2, 4, &secret);
        let subset = &shares[1..3];
        let lag = ss.lagrange(subset).unwrap();
        assert_eq!(ss.recon(subset, Some(&lag)).unwrap(), secret);
    }

    #[test]
    fn test_duplicate_share_rejected() {
        let ss = Sss::new(64).unwrap();
        let shares = ss.share(2, 3, &BigInt::from(99u32));
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert!(matches!(
            ss.recon(&dup, None),
            Err(ProtocolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_share_of_sum() {
        // shares are additively homomorphic per index
        let ss = Sss::new(64).unwrap();
        let a = BigInt::from(1000u32);
        let b = BigInt::from(234u32);
        let sa = ss.share(2, 3, &a);
        let sb = ss.share(2, 3, &b);
        let summed: Vec<Share> = sa.iter().zip(&sb).map(|(x, y)| x + y).collect();
        assert_eq!(ss.recon(&summed[..2], None).unwrap(), &a + &b);
    }
}
