//! Atomic amount helpers.
//!
//! Amounts are plain `u64` atomic units; one coin is 10^12 atomic units.

/// Number of decimal places shown for a whole coin.
pub const DISPLAY_DECIMAL_POINT: u32 = 12;

/// Atomic units per coin.
pub const COIN: u64 = 1_000_000_000_000;

/// Render an atomic amount as a decimal coin string, e.g. `1.500000000000`.
pub fn format_amount(amount: u64) -> String {
    format!(
        "{}.{:0width$}",
        amount / COIN,
        amount % COIN,
        width = DISPLAY_DECIMAL_POINT as usize
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_whole_and_fractional_parts() {
        assert_eq!(format_amount(0), "0.000000000000");
        assert_eq!(format_amount(COIN + COIN / 2), "1.500000000000");
        assert_eq!(format_amount(42), "0.000000000042");
    }
}
