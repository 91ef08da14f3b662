//! 256-bit unsigned arithmetic for targets and hash values.

pub use ruint::aliases::U256;

/// 2^64 as f64, the weight of one limb.
const LIMB_WEIGHT: f64 = 18_446_744_073_709_551_616.0;

/// Convert to the nearest f64.
///
/// Difficulty ratios are reported as floating point; the precision lost
/// here never feeds back into a target comparison.
pub fn to_f64(value: &U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * LIMB_WEIGHT + limb as f64)
}

/// Interpret a 32-byte hash as a little-endian integer.
pub fn from_hash(hash: &[u8; 32]) -> U256 {
    U256::from_le_bytes(*hash)
}

/// Decode a compact `bits` word into the target it encodes.
///
/// The high byte is the size of the target in bytes, the low three bytes
/// are its most significant digits: `mantissa * 256^(exponent - 3)`.
/// Returns `None` when the encoded value does not fit in 256 bits.
pub fn from_compact(bits: u32) -> Option<U256> {
    let exponent = (bits >> 24) as usize;
    let mantissa = U256::from(bits & 0x00ff_ffff);
    if exponent <= 3 {
        Some(mantissa >> (8 * (3 - exponent)))
    } else {
        mantissa.checked_shl(8 * (exponent - 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_bitcoin_diff1() {
        let target = from_compact(0x1d00ffff).unwrap();
        let expected = U256::from(0xffff_u64) << 208;
        assert_eq!(target, expected);
    }

    #[test]
    fn test_compact_small_exponent() {
        // Exponent 3 leaves the mantissa as is, smaller exponents shift right
        assert_eq!(from_compact(0x03123456), Some(U256::from(0x123456_u64)));
        assert_eq!(from_compact(0x02123456), Some(U256::from(0x1234_u64)));
    }

    #[test]
    fn test_compact_overflow() {
        assert_eq!(from_compact(0xff7fffff), None);
    }

    #[test]
    fn test_compact_matches_rust_bitcoin() {
        use bitcoin::pow::{CompactTarget, Target};

        for bits in [0x1d00ffff_u32, 0x207fffff, 0x1703a30c, 0x1b0404cb] {
            let ours = from_compact(bits).unwrap();
            let theirs = Target::from_compact(CompactTarget::from_consensus(bits));
            assert_eq!(ours.to_be_bytes::<32>(), theirs.to_be_bytes(), "bits {:08x}", bits);
        }
    }

    #[test]
    fn test_to_f64() {
        assert_eq!(to_f64(&U256::ZERO), 0.0);
        assert_eq!(to_f64(&U256::from(12345_u64)), 12345.0);

        let big = U256::from(1_u64) << 200;
        assert_eq!(to_f64(&big), 2f64.powi(200));
    }

    #[test]
    fn test_from_hash_is_little_endian() {
        let mut hash = [0u8; 32];
        hash[0] = 1;
        assert_eq!(from_hash(&hash), U256::from(1_u64));

        let mut hash = [0u8; 32];
        hash[31] = 1;
        assert_eq!(from_hash(&hash), U256::from(1_u64) << 248);
    }
}
