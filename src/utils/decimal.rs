//! Decimal arithmetic utilities for exact-balance notional splitting.
//!
//! All splitting is done in integer cents so that the long and short sides of
//! a batch can be made to sum to exactly the same amount, with no floating
//! point drift.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Round a dollar amount down to an even number of cents so it can be halved
/// exactly.
pub fn even_cents(amount: Decimal) -> Decimal {
    let cents = (amount * Decimal::ONE_HUNDRED).floor();
    let cents = cents.to_i64().map(|c| c - (c % 2)).unwrap_or_default();
    Decimal::new(cents, 2)
}

/// Split `total` into amounts proportional to `weights`, in integer cents,
/// with any rounding remainder added to the first part.
///
/// The returned amounts always sum to exactly `total` (which must be a whole
/// number of cents). Callers construct weights from a non-empty leg list.
pub fn split_by_weights(total: Decimal, weights: &[f64]) -> Vec<Decimal> {
    debug_assert!(!weights.is_empty());

    let total_cents = (total * Decimal::ONE_HUNDRED).to_i64().unwrap_or_default();
    let weight_sum: f64 = weights.iter().sum();
    debug_assert!(weight_sum > 0.0);

    let mut cents: Vec<i64> = weights
        .iter()
        .map(|w| ((total_cents as f64) * (w / weight_sum)).floor() as i64)
        .collect();

    // Remainder from flooring goes to the first part to keep the sum exact.
    let assigned: i64 = cents.iter().sum();
    cents[0] += total_cents - assigned;

    cents.into_iter().map(|c| Decimal::new(c, 2)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_even_cents() {
        assert_eq!(even_cents(dec!(100.01)), dec!(100.00));
        assert_eq!(even_cents(dec!(100.02)), dec!(100.02));
        assert_eq!(even_cents(dec!(99.999)), dec!(99.98));
    }

    #[test]
    fn test_split_equal_weights_exact_sum() {
        let parts = split_by_weights(dec!(100.00), &[1.0, 1.0, 1.0]);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().sum::<Decimal>(), dec!(100.00));
        // Remainder of the 33.33/33.33/33.33 split lands on the first part.
        assert_eq!(parts[0], dec!(33.34));
    }

    #[test]
    fn test_split_by_weights_exact_sum() {
        let parts = split_by_weights(dec!(250.01), &[1.0, 2.0, 0.5]);
        assert_eq!(parts.iter().sum::<Decimal>(), dec!(250.01));
        assert!(parts[1] > parts[0] && parts[0] > parts[2]);
    }

    #[test]
    fn test_split_single_part() {
        assert_eq!(split_by_weights(dec!(42.42), &[1.0]), vec![dec!(42.42)]);
    }
}
