use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Mul, Sub};

use num_bigint::{BigInt, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::buildingblocks::utils::{invert, powmod};
use crate::error::{ProtocolError, Result};

/// A prime field Z_p picked from a fixed bucket of moduli, one per supported
/// secret width. Each bucket prime is either a Mersenne prime or of the form
/// 2^k - c for a small c.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeField {
    p: BigInt,
    bits: usize,
}

const BUCKETS: &[(usize, usize, i64)] = &[
    // (secret bits, modulus exponent, subtracted constant)
    (64, 65, 493),
    (128, 129, 1365),
    (256, 257, 2233),
    (512, 521, 1),
    (1024, 1279, 1),
    (2048, 2203, 1),
];

impl PrimeField {
    /// Picks the smallest bucket whose width covers `bitlength`-bit secrets.
    pub fn for_secret_bits(bitlength: usize) -> Result<PrimeField> {
        for &(secret_bits, exponent, c) in BUCKETS {
            if bitlength <= secret_bits {
                let p = (BigInt::one() << exponent) - BigInt::from(c);
                return Ok(PrimeField { p, bits: bitlength });
            }
        }
        Err(ProtocolError::invalid(format!(
            "no sufficient field for {bitlength}-bit secrets"
        )))
    }

    pub fn modulus(&self) -> &BigInt {
        &self.p
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn element(&self, value: BigInt) -> FieldElement {
        FieldElement {
            value: value.mod_floor(&self.p),
            modulus: self.p.clone(),
            bits: self.bits,
        }
    }

    /// Interprets big-endian bytes as a field element.
    pub fn element_from_bytes(&self, bytes: &[u8]) -> FieldElement {
        self.element(BigInt::from_bytes_be(Sign::Plus, bytes))
    }

    pub fn zero(&self) -> FieldElement {
        self.element(BigInt::zero())
    }

    pub fn one(&self) -> FieldElement {
        self.element(BigInt::one())
    }
}

/// An element of Z_p. Equality and hashing look at the reduced value only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldElement {
    value: BigInt,
    modulus: BigInt,
    bits: usize,
}

impl FieldElement {
    pub fn value(&self) -> &BigInt {
        &self.value
    }

    pub fn into_value(self) -> BigInt {
        self.value
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn inverse(&self) -> Result<FieldElement> {
        if self.value.is_zero() {
            return Err(ProtocolError::invalid("inversion of zero"));
        }
        Ok(FieldElement {
            value: invert(&self.value, &self.modulus)?,
            modulus: self.modulus.clone(),
            bits: self.bits,
        })
    }

    pub fn pow(&self, exponent: &BigInt) -> Result<FieldElement> {
        Ok(FieldElement {
            value: powmod(&self.value, exponent, &self.modulus)?,
            modulus: self.modulus.clone(),
            bits: self.bits,
        })
    }
}

impl PartialEq for FieldElement {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for FieldElement {}

impl Hash for FieldElement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (mod {})", self.value, self.modulus)
    }
}

impl<'a, 'b> Add<&'b FieldElement> for &'a FieldElement {
    type Output = FieldElement;

    fn add(self, rhs: &'b FieldElement) -> FieldElement {
        debug_assert_eq!(self.modulus, rhs.modulus, "mixed-field arithmetic");
        FieldElement {
            value: (&self.value + &rhs.value).mod_floor(&self.modulus),
            modulus: self.modulus.clone(),
            bits: self.bits,
        }
    }
}

impl<'a, 'b> Sub<&'b FieldElement> for &'a FieldElement {
    type Output = FieldElement;

    fn sub(self, rhs: &'b FieldElement) -> FieldElement {
        debug_assert_eq!(self.modulus, rhs.modulus, "mixed-field arithmetic");
        FieldElement {
            value: (&self.value - &rhs.value).mod_floor(&self.modulus),
            modulus: self.modulus.clone(),
            bits: self.bits,
        }
    }
}

impl<'a, 'b> Mul<&'b FieldElement> for &'a FieldElement {
    type Output = FieldElement;

    fn mul(self, rhs: &'b FieldElement) -> FieldElement {
        debug_assert_eq!(self.modulus, rhs.modulus, "mixed-field arithmetic");
        FieldElement {
            value: (&self.value * &rhs.value).mod_floor(&self.modulus),
            modulus: self.modulus.clone(),
            bits: self.bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_selection() {
        let f = PrimeField::for_secret_bits(128).unwrap();
        assert_eq!(*f.modulus(), (BigInt::one() << 129) - BigInt::from(1365));
        let f = PrimeField::for_secret_bits(100).unwrap();
        assert_eq!(*f.modulus(), (BigInt::one() << 129) - BigInt::from(1365));
        let f = PrimeField::for_secret_bits(2048).unwrap();
        assert_eq!(*f.modulus(), (BigInt::one() << 2203) - BigInt::one());
        assert!(PrimeField::for_secret_bits(4096).is_err());
    }

    #[test]
    fn test_field_ops() {
        let f = PrimeField::for_secret_bits(64).unwrap();
        let a = f.element(BigInt::from(1234));
        let b = f.element(BigInt::from(5678));
        assert_eq!((&a + &b).value(), &BigInt::from(6912));
        assert_eq!((&b - &a).value(), &BigInt::from(4444));
        assert_eq!((&a * &f.one()), a);
        // subtraction wraps into [0, p)
        let wrapped = &a - &b;
        assert_eq!(&wrapped + &b, a);
    }

    #[test]
    fn test_inverse() {
        let f = PrimeField::for_secret_bits(64).unwrap();
        let a = f.element(BigInt::from(987654321));
        let inv = a.inverse().unwrap();
        assert_eq!(&a * &inv, f.one());
        assert!(f.zero().inverse().is_err());
    }

    #[test]
    fn test_pow_matches_repeated_mul() {
        let f = PrimeField::for_secret_bits(64).unwrap();
        let a = f.element(BigInt::from(3));
        let cube = a.pow(&BigInt::from(3)).unwrap();
        assert_eq!(cube, &(&a * &a) * &a);
    }

    #[test]
    fn test_element_from_bytes() {
        let f = PrimeField::for_secret_bits(64).unwrap();
        let e = f.element_from_bytes(&[0x01, 0x00]);
        assert_eq!(e.value(), &BigInt::from(256));
    }
}
