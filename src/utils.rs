// Shared helpers for money formatting and rounding.

use rust_decimal::{Decimal, RoundingStrategy};

/// Format an EUR amount with two decimals, e.g. `12.50`.
pub fn format_eur(amount: Decimal) -> String {
    format!("{:.2}", quantize_floor(amount))
}

/// Round down to the cent. Discount math always floors so a customer is
/// never charged a fraction above the advertised total.
pub fn quantize_floor(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Round half-up to the cent. Used when converting a paid crypto amount to
/// EUR, matching the gateway's own settlement rounding.
pub fn quantize_half_up(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Trim + lowercase, the comparison form for scope lists and currency codes.
pub fn normalize_token(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn quantize_floor_truncates() {
        assert_eq!(quantize_floor(d("10.999")), d("10.99"));
        assert_eq!(quantize_floor(d("10.001")), d("10.00"));
    }

    #[test]
    fn quantize_half_up_rounds_midpoint_up() {
        assert_eq!(quantize_half_up(d("10.005")), d("10.01"));
        assert_eq!(quantize_half_up(d("10.004")), d("10.00"));
    }

    #[test]
    fn format_eur_always_two_decimals() {
        assert_eq!(format_eur(d("5")), "5.00");
        assert_eq!(format_eur(d("12.5")), "12.50");
    }

    #[test]
    fn normalize_token_trims_and_lowercases() {
        assert_eq!(normalize_token("  Berlin "), "berlin");
    }
}
