pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use num_bigint::BigInt;
use num_traits::One;

use crate::buildingblocks::prg::{Prg, PRG_SECURITY};
use crate::buildingblocks::shamir::Sss;
use crate::buildingblocks::vector_encoding::log2_ceil;
use crate::error::{ProtocolError, Result};

/// Parameters of the mask-pairwise protocol. No Joye-Libert material here:
/// inputs are hidden purely by pairwise PRG masks and a self mask, all in
/// Z_{2^expandedsize}.
#[derive(Debug, Clone)]
pub struct PairwiseParams {
    pub dimension: usize,
    pub valuesize: usize,
    pub keysize: usize,
    pub threshold: usize,
    pub nclients: usize,
    pub users: Vec<u16>,
    pub prg: Prg,
    pub ss_seed: Sss,
    pub ss_key: Sss,
}

impl PairwiseParams {
    pub fn init(
        dimension: usize,
        valuesize: usize,
        keysize: usize,
        threshold: usize,
        nclients: usize,
    ) -> Result<Self> {
        if threshold == 0 || threshold > nclients {
            return Err(ProtocolError::invalid("threshold must be in [1, nclients]"));
        }
        let expanded = valuesize + log2_ceil(nclients);
        Ok(PairwiseParams {
            dimension,
            valuesize,
            keysize,
            threshold,
            nclients,
            users: (1..=nclients as u16).collect(),
            prg: Prg::new(dimension, expanded),
            ss_seed: Sss::new(PRG_SECURITY)?,
            ss_key: Sss::new(keysize)?,
        })
    }

    /// Bit width of masked values: valuesize plus room for nclients sums.
    pub fn expandedsize(&self) -> usize {
        self.prg.elementsize()
    }

    /// The ring all masking arithmetic happens in, 2^expandedsize.
    pub fn mask_modulus(&self) -> BigInt {
        BigInt::one() << self.expandedsize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_widths() {
        let params = PairwiseParams::init(100, 16, 256, 7, 10).unwrap();
        assert_eq!(params.expandedsize(), 20);
        assert_eq!(params.users.len(), 10);
        assert!(PairwiseParams::init(100, 16, 256, 11, 10).is_err());
    }
}
