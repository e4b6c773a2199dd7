//! Decimal rendering of raw token amounts

use alloy::primitives::{I256, U256};
use bigdecimal::{BigDecimal, RoundingMode};
use std::str::FromStr;

use crate::constants;

/// Fractional digits shown for reward shares
pub const REWARD_SCALE: i64 = 8;

fn unit() -> U256 {
    U256::from(10u64).pow(U256::from(constants::TOKEN_DECIMALS))
}

/// Render wei as a token amount: shortest form with at least one fractional digit
///
/// `100 * 10^18` -> `"100.0"`, `0` -> `"0.0"`, `125 * 10^17` -> `"12.5"`.
pub fn format_token(amount: U256) -> String {
    let unit = unit();
    let whole = amount / unit;
    let fractional = amount % unit;

    let fractional = format!(
        "{:0>width$}",
        fractional.to_string(),
        width = constants::TOKEN_DECIMALS as usize
    );
    let trimmed = fractional.trim_end_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };

    format!("{}.{}", whole, trimmed)
}

/// Signed wei delta as a token amount with exactly eight fractional digits (half-even)
pub fn format_reward(delta: I256) -> String {
    let decimal = to_decimal(delta).with_scale_round(REWARD_SCALE, RoundingMode::HalfEven);
    let (digits, scale) = decimal.as_bigint_and_exponent();
    debug_assert_eq!(scale, REWARD_SCALE);

    let digits = digits.to_string();
    let (sign, magnitude) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", digits.as_str()),
    };

    let scale = REWARD_SCALE as usize;
    let padded = format!("{:0>width$}", magnitude, width = scale + 1);
    let (whole, fractional) = padded.split_at(padded.len() - scale);
    format!("{}{}.{}", sign, whole, fractional)
}

fn to_decimal(delta: I256) -> BigDecimal {
    // I256's Display is plain base-10, so this always parses
    BigDecimal::from_str(&format!("{}e-{}", delta, constants::TOKEN_DECIMALS)).unwrap_or_default()
}

/// Reinterpret an on-chain amount as signed for delta arithmetic
pub fn signed(amount: U256) -> I256 {
    I256::from_raw(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(whole: u64) -> U256 {
        U256::from(whole) * unit()
    }

    #[test]
    fn test_format_token_trims_to_one_decimal() {
        assert_eq!(format_token(tokens(100)), "100.0");
        assert_eq!(format_token(U256::ZERO), "0.0");
        assert_eq!(format_token(U256::from(125u64) * U256::from(10u64).pow(U256::from(17))), "12.5");
    }

    #[test]
    fn test_format_token_keeps_wei_precision() {
        assert_eq!(format_token(U256::from(1u64)), "0.000000000000000001");
        assert_eq!(
            format_token(tokens(3) + U256::from(40_000_000_000_000_000u64)),
            "3.04"
        );
    }

    #[test]
    fn test_format_reward_fixed_scale() {
        assert_eq!(format_reward(signed(tokens(2))), "2.00000000");
        assert_eq!(format_reward(I256::ZERO), "0.00000000");
        assert_eq!(format_reward(-signed(tokens(1))), "-1.00000000");
        assert_eq!(format_reward(signed(U256::from(10_000_000_000u64))), "0.00000001");
    }

    #[test]
    fn test_format_reward_rounds_half_even() {
        // 0.000000005 -> 0.00000000, 0.000000015 -> 0.00000002
        assert_eq!(format_reward(signed(U256::from(5_000_000_000u64))), "0.00000000");
        assert_eq!(format_reward(signed(U256::from(15_000_000_000u64))), "0.00000002");
        assert_eq!(format_reward(-signed(U256::from(15_000_000_000u64))), "-0.00000002");
    }
}
