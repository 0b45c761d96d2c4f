//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// Upper bound for any single amount or running total, in satoshi.
pub const MAX_MONEY: Amount = 2_535_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Range check against a network-specific ceiling (`max_money_out`).
pub fn money_range_with_limit(value: Amount, limit: Amount) -> bool {
    (0..=limit).contains(&value)
}

/// Renders `value` as a decimal coin amount, e.g. `12.50000000`.
pub fn format_money(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let coin = COIN as u64;
    format!("{sign}{}.{:08}", abs / coin, abs % coin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(-1));
        assert!(!money_range(MAX_MONEY + 1));
        assert!(money_range_with_limit(5 * COIN, 5 * COIN));
        assert!(!money_range_with_limit(5 * COIN + 1, 5 * COIN));
    }

    #[test]
    fn format_money_pads_fraction() {
        assert_eq!(format_money(1_250 * COIN + 5), "1250.00000005");
        assert_eq!(format_money(-CENT), "-0.01000000");
    }
}
