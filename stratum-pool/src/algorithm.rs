//! Proof-of-work algorithm strategy.
//!
//! Share validation needs three things from the coin's proof-of-work: the
//! hash of an 80-byte header, the difficulty-1 target, and the multiplier
//! that scales raw difficulty into the units miners are paid in. Those are
//! bundled behind [`PowAlgorithm`] and injected into the job manager, so
//! no hash function is hardwired into the validation path.

use std::fmt;
use std::sync::Arc;

use crate::codec::sha256d;
use crate::u256::{self, U256};

/// Proof-of-work capability used by share validation.
pub trait PowAlgorithm: Send + Sync + fmt::Debug {
    /// Short name for logs, e.g. "sha256d".
    fn name(&self) -> &str;

    /// Hash a serialized block header. The result is read as a
    /// little-endian integer and compared against targets.
    fn hash(&self, header: &[u8]) -> [u8; 32];

    /// Target corresponding to difficulty 1.
    fn diff1(&self) -> U256;

    /// Scale applied to raw difficulty ratios.
    fn multiplier(&self) -> f64;

    /// Difficulty represented by a target or hash value.
    fn difficulty_of(&self, value: &U256) -> f64 {
        u256::to_f64(&self.diff1()) / u256::to_f64(value)
    }
}

/// Bitcoin's difficulty-1 target, `0x00000000ffff0000...`.
pub fn bitcoin_diff1() -> U256 {
    U256::from(0xffff_u64) << 208
}

/// Double SHA-256 proof of work.
///
/// Defaults to Bitcoin's parameters; coins that reuse the hash with a
/// different difficulty-1 target or share multiplier override them.
#[derive(Debug, Clone)]
pub struct Sha256d {
    diff1: U256,
    multiplier: f64,
}

impl Sha256d {
    pub fn new(diff1: U256, multiplier: f64) -> Self {
        Self { diff1, multiplier }
    }
}

impl Default for Sha256d {
    fn default() -> Self {
        Self::new(bitcoin_diff1(), 1.0)
    }
}

impl PowAlgorithm for Sha256d {
    fn name(&self) -> &str {
        "sha256d"
    }

    fn hash(&self, header: &[u8]) -> [u8; 32] {
        sha256d(header)
    }

    fn diff1(&self) -> U256 {
        self.diff1
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

/// Look up an algorithm by name, applying optional overrides.
///
/// Returns `None` for names this build doesn't know.
pub fn from_name(
    name: &str,
    diff1: Option<U256>,
    multiplier: Option<f64>,
) -> Option<Arc<dyn PowAlgorithm>> {
    match name.to_ascii_lowercase().as_str() {
        "sha256" | "sha256d" => {
            let defaults = Sha256d::default();
            Some(Arc::new(Sha256d::new(
                diff1.unwrap_or(defaults.diff1),
                multiplier.unwrap_or(defaults.multiplier),
            )))
        }
        _ => None,
    }
}
