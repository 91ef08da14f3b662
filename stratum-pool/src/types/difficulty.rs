//! Share difficulty as negotiated with miners.

use serde::{Serialize, Serializer};
use std::fmt;

/// Share difficulty assigned to a connection.
///
/// Stratum carries difficulty as a plain JSON number, and the vardiff
/// controller produces fractional values such as `0.5` or `12.34567891`,
/// so this wraps an `f64` rather than a target. A `Difficulty` is always
/// finite and strictly positive.
///
/// A share at difficulty `d` is worth `d` shares at difficulty 1; the
/// relation to a hash value is
/// ```text
/// share_difficulty = diff1 / hash * multiplier
/// ```
/// where `diff1` and `multiplier` come from the proof-of-work algorithm.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Difficulty(f64);

impl Difficulty {
    /// Difficulty 1, the easiest whole-number difficulty.
    pub const ONE: Self = Self(1.0);

    /// Create a difficulty, rejecting zero, negative, and non-finite values.
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && value > 0.0).then_some(Self(value))
    }

    /// Get the difficulty as f64.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Round to a fixed number of decimal places.
    ///
    /// Falls back to `self` if rounding would produce zero.
    pub fn rounded(self, decimals: i32) -> Self {
        let scale = 10f64.powi(decimals);
        Self::new((self.0 * scale).round() / scale).unwrap_or(self)
    }
}

impl Serialize for Difficulty {
    // Whole numbers go out as JSON integers ("8", not "8.0"); some miner
    // firmware parses set_difficulty with an integer parser.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.fract() == 0.0 && self.0 <= (1u64 << 53) as f64 {
            serializer.serialize_u64(self.0 as u64)
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        // Handle sub-1.0 difficulties with adaptive precision
        if value < 1.0 {
            let s = format!("{:.6}", value);
            let trimmed = s.trim_end_matches('0').trim_end_matches('.');
            return write!(f, "{}", trimmed);
        }

        // Format with SI suffixes (K, M, G, T, P)
        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}
