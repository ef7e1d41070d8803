use nalgebra::DVector;
use num_bigint::{BigInt, RandBigInt};
use num_integer::Integer;
use num_traits::One;
use rand::rngs::OsRng;

use crate::error::{ProtocolError, Result};

/// Adds two vectors component-wise mod `r`.
pub fn add_vectors(a: &DVector<BigInt>, b: &DVector<BigInt>, r: &BigInt) -> DVector<BigInt> {
    assert_eq!(a.len(), b.len(), "adding vectors of different lengths");
    DVector::from_fn(a.len(), |i, _| (&a[i] + &b[i]).mod_floor(r))
}

/// Subtracts two vectors component-wise mod `r`.
pub fn subs_vectors(a: &DVector<BigInt>, b: &DVector<BigInt>, r: &BigInt) -> DVector<BigInt> {
    assert_eq!(a.len(), b.len(), "subtracting vectors of different lengths");
    DVector::from_fn(a.len(), |i, _| (&a[i] - &b[i]).mod_floor(r))
}

/// Finds the inverse of `a` mod `m`. Fails when `gcd(a, m) != 1`.
pub fn invert(a: &BigInt, m: &BigInt) -> Result<BigInt> {
    let e = a.extended_gcd(m);
    if !e.gcd.is_one() {
        return Err(ProtocolError::invalid("no inverse exists"));
    }
    Ok(e.x.mod_floor(m))
}

/// Computes `a^b mod m`, accepting negative exponents whenever `a` is
/// invertible mod `m`.
pub fn powmod(a: &BigInt, b: &BigInt, m: &BigInt) -> Result<BigInt> {
    if a.is_one() {
        return Ok(BigInt::one());
    }
    if b.sign() == num_bigint::Sign::Minus {
        let inv = invert(a, m)?;
        Ok(inv.modpow(&-b, m))
    } else {
        Ok(a.modpow(b, m))
    }
}

/// Returns a prime of exactly `bits` bits: the top bit of a random `bits`-bit
/// integer is forced and the candidate advanced to the next prime.
pub fn getprimeover(bits: u64) -> BigInt {
    let mut rng = OsRng;
    let mut candidate = rng.gen_biguint(bits);
    candidate.set_bit(bits - 1, true);
    loop {
        candidate += 1u32;
        // num-primes carries its own bignum type, so the candidate crosses the
        // crate boundary as raw bytes.
        let probe = num_primes::BigUint::from_bytes_be(&candidate.to_bytes_be());
        if num_primes::Verification::is_prime(&probe) {
            return BigInt::from(candidate);
        }
    }
}

pub fn factorial(n: usize) -> BigInt {
    (1..=n).fold(BigInt::one(), |acc, i| acc * BigInt::from(i))
}

/// Generates `set_`/`get_` accessors for `Option` fields that earlier round
/// steps must have populated. The getter names the owning party in its panic
/// message.
#[macro_export]
macro_rules! generate_getters_and_setters {
    ($struct_name:ident, $id_field:ident, $( $field_name:ident : $field_type:ty ),* ) => {
        impl $struct_name {
            paste! {
                $(
                    // Setter
                    pub fn [<set_ $field_name>](&mut self, value: $field_type) -> &mut Self {
                        self.$field_name = Some(value);
                        self
                    }

                    // Getter with expect
                    pub fn [<get_ $field_name>](&self) -> &$field_type {
                        self.$field_name.as_ref().expect(
                            format!(
                                "Field '{}' is None for {} with {} {}",
                                stringify!($field_name),
                                stringify!($struct_name),
                                stringify!($id_field),
                                self.$id_field
                            ).as_str()
                        )
                    }
                )*
            }
        }
    };
}
