use nalgebra::DVector;
use num_bigint::BigInt;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

/// Packs vectors of small values into large modular residues.
///
/// Values occupy `elementsize`-bit slots, sized so that `addops` packed
/// vectors can be added without any slot overflowing into its neighbour;
/// `batchsize` slots fit into one `ptsize`-bit plaintext residue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ves {
    pub ptsize: usize,
    pub addops: usize,
    pub valuesize: usize,
    pub vectorsize: usize,
    pub elementsize: usize,
    pub batchsize: usize,
    pub numbatches: usize,
}

impl Ves {
    pub fn new(ptsize: usize, addops: usize, valuesize: usize, vectorsize: usize) -> Self {
        let elementsize = valuesize + log2_ceil(addops);
        let batchsize = ptsize / elementsize;
        let numbatches = vectorsize.div_ceil(batchsize);
        Ves {
            ptsize,
            addops,
            valuesize,
            vectorsize,
            elementsize,
            batchsize,
            numbatches,
        }
    }

    /// Packs `v` into `numbatches` residues; the final batch may be short.
    pub fn encode(&self, v: &DVector<BigInt>) -> Vec<BigInt> {
        assert_eq!(v.len(), self.vectorsize, "encoding a vector of the wrong size");
        let mut batches = Vec::with_capacity(self.numbatches);
        for chunk in v.as_slice().chunks(self.batchsize) {
            let mut packed = BigInt::zero();
            for (i, value) in chunk.iter().enumerate() {
                packed |= value << (self.elementsize * i);
            }
            batches.push(packed);
        }
        batches
    }

    /// Unpacks residues back into a vector of `vectorsize` values.
    pub fn decode(&self, batches: &[BigInt]) -> DVector<BigInt> {
        assert_eq!(batches.len(), self.numbatches, "decoding the wrong number of batches");
        let mask = (BigInt::one() << self.elementsize) - BigInt::one();
        let mut values = Vec::with_capacity(self.vectorsize);
        for (c, batch) in batches.iter().enumerate() {
            let in_batch = if c == self.numbatches - 1 {
                self.vectorsize - self.batchsize * c
            } else {
                self.batchsize
            };
            let mut b = batch.clone();
            for _ in 0..in_batch {
                values.push(&b & &mask);
                b >>= self.elementsize;
            }
        }
        DVector::from_vec(values)
    }
}

pub fn log2_ceil(n: usize) -> usize {
    assert!(n > 0);
    n.next_power_of_two().trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[u64]) -> DVector<BigInt> {
        DVector::from_vec(values.iter().map(|&v| BigInt::from(v)).collect())
    }

    #[test]
    fn test_derived_sizes() {
        let ve = Ves::new(512, 10, 16, 1000);
        assert_eq!(ve.elementsize, 20);
        assert_eq!(ve.batchsize, 25);
        assert_eq!(ve.numbatches, 40);

        let ve = Ves::new(64, 3, 8, 7);
        assert_eq!(ve.elementsize, 10);
        assert_eq!(ve.batchsize, 6);
        assert_eq!(ve.numbatches, 2);
    }

    #[test]
    fn test_roundtrip_with_short_final_batch() {
        let ve = Ves::new(64, 3, 8, 7);
        let v = vector(&[1, 2, 0, 255, 17, 0, 42]);
        let batches = ve.encode(&v);
        assert_eq!(batches.len(), 2);
        assert_eq!(ve.decode(&batches), v);
    }

    #[test]
    fn test_zero_slots_keep_alignment() {
        // zeros anywhere, including the top slot of a batch, must not shift
        // later coordinates
        let ve = Ves::new(64, 3, 8, 7);
        let v = vector(&[0, 0, 9, 0, 0, 0, 0]);
        assert_eq!(ve.decode(&ve.encode(&v)), v);
    }

    #[test]
    fn test_sum_of_encodings_decodes_to_slot_sums() {
        let ve = Ves::new(64, 4, 8, 5);
        let a = vector(&[250, 1, 0, 77, 255]);
        let b = vector(&[250, 2, 3, 0, 255]);
        let ea = ve.encode(&a);
        let eb = ve.encode(&b);
        let summed: Vec<BigInt> = ea.iter().zip(&eb).map(|(x, y)| x + y).collect();
        let decoded = ve.decode(&summed);
        for i in 0..5 {
            assert_eq!(decoded[i], &a[i] + &b[i]);
        }
    }
}
