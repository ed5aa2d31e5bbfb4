//! Conversion of raw holding register words into numbers.
//!
//! Nothing in here performs I/O or keeps state. The caller is responsible for
//! handing in words that exist; index checks happen once per register table, not
//! per value.

/// Order in which a meter stores the two halves of a 32 bit quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    /// Most significant word at the lower address (Lovato).
    HighFirst,
    /// Least significant word at the lower address (Carlo Gavazzi).
    LowFirst,
}

impl WordOrder {
    /// Returns `(high, low)` for the two words starting at `words[0]`.
    pub fn split(&self, words: &[u16]) -> (u16, u16) {
        match self {
            WordOrder::HighFirst => (words[0], words[1]),
            WordOrder::LowFirst => (words[1], words[0]),
        }
    }
}

pub fn combine_u32(high: u16, low: u16) -> u32 {
    u32::from(high) << 16 | u32::from(low)
}

pub fn combine_i32(high: u16, low: u16) -> i32 {
    combine_u32(high, low) as i32
}

/// Multiplies `raw` with `factor` and rounds the product to `decimals` places.
pub fn scale(raw: f64, factor: f64, decimals: u32) -> f64 {
    let pow = 10f64.powi(decimals as i32);
    (raw * factor * pow).round() / pow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_u32() {
        assert_eq!(combine_u32(0, 0), 0);
        assert_eq!(combine_u32(0x0001, 0x0000), 0x0001_0000);
        assert_eq!(combine_u32(0x1234, 0xABCD), 0x1234_ABCD);
        assert_eq!(combine_u32(0xFFFF, 0xFFFF), u32::MAX);
    }

    #[test]
    fn test_combine_i32_sign() {
        assert_eq!(combine_i32(0x0000, 0x0064), 100);
        assert_eq!(combine_i32(0x7FFF, 0xFFFF), i32::MAX);
        assert_eq!(combine_i32(0x8000, 0x0000), i32::MIN);
        assert_eq!(combine_i32(0xFFFF, 0xFFFF), -1);
        assert_eq!(combine_i32(0xFFFF, 0xFF9C), -100);
    }

    #[test]
    fn test_combine_i32_matches_unsigned_bits() {
        for (h, l) in [(0u16, 1u16), (0x7FFF, 0x0001), (0x8001, 0x1234), (0xFFFE, 0xFFFF)] {
            let unsigned = combine_u32(h, l) as i64;
            let expected = if unsigned > 0x7FFF_FFFF { unsigned - 0x1_0000_0000 } else { unsigned };
            assert_eq!(combine_i32(h, l) as i64, expected);
        }
    }

    #[test]
    fn test_word_order() {
        let words = [0x0001, 0x0002];
        assert_eq!(WordOrder::HighFirst.split(&words), (0x0001, 0x0002));
        assert_eq!(WordOrder::LowFirst.split(&words), (0x0002, 0x0001));
    }

    #[test]
    fn test_scale_exact() {
        assert_eq!(scale(2345.0, 0.1, 1), 234.5);
        assert_eq!(scale(23012.0, 0.01, 2), 230.12);
        assert_eq!(scale(51234.0, 0.0001, 4), 5.1234);
        assert_eq!(scale(987.0, 0.001, 3), 0.987);
        assert_eq!(scale(-12345.0, 0.01, 2), -123.45);
    }

    #[test]
    fn test_scale_rounds() {
        assert_eq!(scale(12345.0, 0.001, 1), 12.3);
        assert_eq!(scale(12344.0, 0.001, 2), 12.34);
        assert_eq!(scale(12346.0, 0.001, 2), 12.35);
    }

    #[test]
    fn test_scale_idempotent_with_unit_factor() {
        for (raw, factor, decimals) in [(2345.0, 0.1, 1), (51234.0, 0.0001, 4), (777.0, 0.01, 2)] {
            let once = scale(raw, factor, decimals);
            assert_eq!(scale(once, 1.0, decimals), once);
        }
    }
}
