use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use nalgebra::DVector;
use num_bigint::{BigInt, Sign};
use num_integer::Integer;
use num_traits::One;

/// Counter block layout: 12-byte zero nonce followed by a 32-bit big-endian
/// counter starting at zero.
type Aes128Ctr = Ctr32BE<Aes128>;

pub const PRG_SECURITY: usize = 128;

/// Stretches a 128-bit seed into a vector of `vectorsize` integers, each
/// reduced mod 2^elementsize, by running AES-128-CTR over an all-zero buffer.
///
/// The counter block is fixed, so a seed must never be used for more than one
/// evaluation; callers get that for free because mask seeds are freshly
/// sampled every round.
#[derive(Debug, Clone, PartialEq)]
pub struct Prg {
    vectorsize: usize,
    elementsize: usize,
    chunk: usize,
}

impl Prg {
    pub fn new(vectorsize: usize, elementsize: usize) -> Self {
        Prg {
            vectorsize,
            elementsize,
            chunk: elementsize.div_ceil(8),
        }
    }

    pub fn elementsize(&self) -> usize {
        self.elementsize
    }

    /// Expands `seed` deterministically. Seeds wider than 128 bits are masked
    /// down to their low 128 bits first.
    pub fn eval(&self, seed: &BigInt) -> DVector<BigInt> {
        let masked = seed.mod_floor(&(BigInt::one() << PRG_SECURITY));
        let bytes = masked.to_bytes_be().1;
        let mut key = [0u8; PRG_SECURITY / 8];
        key[PRG_SECURITY / 8 - bytes.len()..].copy_from_slice(&bytes);

        let mut buf = vec![0u8; self.chunk * self.vectorsize];
        let mut cipher = Aes128Ctr::new(&key.into(), &[0u8; 16].into());
        cipher.apply_keystream(&mut buf);

        let modulus = BigInt::one() << self.elementsize;
        DVector::from_fn(self.vectorsize, |i, _| {
            BigInt::from_bytes_be(Sign::Plus, &buf[i * self.chunk..(i + 1) * self.chunk])
                .mod_floor(&modulus)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    #[test]
    fn test_deterministic() {
        let prg = Prg::new(100, 16);
        let seed = BigInt::from(0x1122334455667788u64);
        assert_eq!(prg.eval(&seed), prg.eval(&seed));
        assert_ne!(prg.eval(&seed), prg.eval(&BigInt::from(1u32)));
    }

    #[test]
    fn test_output_shape_and_range() {
        let prg = Prg::new(1000, 20);
        let out = prg.eval(&BigInt::from(7u32));
        assert_eq!(out.len(), 1000);
        let bound = BigInt::one() << 20;
        assert!(out.iter().all(|x| x >= &BigInt::zero() && x < &bound));
    }

    #[test]
    fn test_wide_seed_masked_to_low_bits() {
        let prg = Prg::new(32, 8);
        let seed = BigInt::from(0xABCDu32);
        let wide = &seed + (BigInt::one() << 200);
        assert_eq!(prg.eval(&seed), prg.eval(&wide));
    }

    #[test]
    fn test_known_keystream() {
        // AES-128 of the all-zero block under the all-zero key; with an
        // 8-bit element size the first 16 outputs are the raw keystream.
        let prg = Prg::new(16, 8);
        let out = prg.eval(&BigInt::zero());
        let expected = hex::decode("66e94bd4ef8a2c3b884cfa59ca342b2e").unwrap();
        for (x, b) in out.iter().zip(expected) {
            assert_eq!(*x, BigInt::from(b));
        }
    }
}
