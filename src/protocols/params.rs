use num_bigint::BigInt;
use num_traits::One;

use crate::buildingblocks::joye_libert::{PublicParam, Tjls, DEFAULT_KEY_SIZE};
use crate::buildingblocks::prg::{Prg, PRG_SECURITY};
use crate::buildingblocks::shamir::Sss;
use crate::buildingblocks::vector_encoding::{log2_ceil, Ves};
use crate::error::{ProtocolError, Result};

/// One run configuration: vector dimension, per-element bit width, key bit
/// length, reconstruction threshold, client count, and the dropout fraction
/// a harness should apply. Constant for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub dimension: usize,
    pub inputsize: usize,
    pub keysize: usize,
    pub threshold: usize,
    pub nclients: usize,
    pub dropout: f64,
}

impl Scenario {
    pub fn new(
        dimension: usize,
        inputsize: usize,
        keysize: usize,
        threshold: usize,
        nclients: usize,
        dropout: f64,
    ) -> Self {
        Scenario {
            dimension,
            inputsize,
            keysize,
            threshold,
            nclients,
            dropout,
        }
    }

    /// Number of clients a harness drops in this scenario.
    pub fn ndropped(&self) -> usize {
        (self.nclients as f64 * self.dropout) as usize
    }
}

/// The immutable parameter set shared by the server and every client of one
/// run: the scenario values plus the building blocks derived from them.
///
/// Masked inputs live in Z_{2^expandedsize}; the packed slots of the vector
/// encoding carry additional headroom so that adding `nclients` masked
/// vectors never overflows a slot into its neighbour.
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    pub dimension: usize,
    pub valuesize: usize,
    pub keysize: usize,
    pub threshold: usize,
    pub nclients: usize,
    pub users: Vec<u16>,
    pub ve: Ves,
    pub prg: Prg,
    pub ss: Sss,
    pub tjl: Tjls,
    pub pp: PublicParam,
}

impl ProtocolParams {
    pub fn init(
        dimension: usize,
        valuesize: usize,
        keysize: usize,
        threshold: usize,
        nclients: usize,
        pp: PublicParam,
    ) -> Result<Self> {
        if threshold == 0 || threshold > nclients {
            return Err(ProtocolError::invalid("threshold must be in [1, nclients]"));
        }
        if pp.bits() != keysize / 2 {
            return Err(ProtocolError::invalid(
                "public parameters generated for a different key size",
            ));
        }
        let expanded = valuesize + log2_ceil(nclients);
        let ve = Ves::new(keysize / 4, nclients, expanded, dimension);
        let prg = Prg::new(dimension, expanded);
        let ss = Sss::new(PRG_SECURITY)?;
        let tjl = Tjls::new(nclients, threshold, keysize, ve.clone());
        Ok(ProtocolParams {
            dimension,
            valuesize,
            keysize,
            threshold,
            nclients,
            users: (1..=nclients as u16).collect(),
            ve,
            prg,
            ss,
            tjl,
            pp,
        })
    }

    pub fn from_scenario(scenario: &Scenario, pp: PublicParam) -> Result<Self> {
        ProtocolParams::init(
            scenario.dimension,
            scenario.inputsize,
            scenario.keysize,
            scenario.threshold,
            scenario.nclients,
            pp,
        )
    }

    /// Generates fresh public parameters for a scenario along with the
    /// derived parameter set. Key material from the trusted setup is
    /// discarded; protection keys come from the pairwise key agreement.
    pub fn setup(scenario: &Scenario) -> Result<Self> {
        let ve = Ves::new(
            scenario.keysize / 4,
            scenario.nclients,
            scenario.inputsize + log2_ceil(scenario.nclients),
            scenario.dimension,
        );
        let tjl = Tjls::new(
            scenario.nclients,
            scenario.threshold,
            scenario.keysize,
            ve,
        );
        let (pp, _, _) = tjl.setup()?;
        ProtocolParams::from_scenario(scenario, pp)
    }

    /// Bit width of masked values: inputsize plus room for nclients sums.
    pub fn expandedsize(&self) -> usize {
        self.prg.elementsize()
    }

    /// The ring the masking layer works in, 2^expandedsize.
    pub fn mask_modulus(&self) -> BigInt {
        BigInt::one() << self.expandedsize()
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario::new(1000, 16, DEFAULT_KEY_SIZE, 7, 10, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_widths() {
        let scenario = Scenario::new(1000, 16, 256, 4, 10, 0.2);
        let params = ProtocolParams::setup(&scenario).unwrap();
        assert_eq!(params.expandedsize(), 20);
        // packed slots carry headroom beyond the mask ring
        assert_eq!(params.ve.elementsize, 24);
        assert_eq!(params.users.len(), 10);
        assert_eq!(scenario.ndropped(), 2);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let scenario = Scenario::new(10, 8, 256, 11, 10, 0.0);
        assert!(ProtocolParams::setup(&scenario).is_err());
    }
}
