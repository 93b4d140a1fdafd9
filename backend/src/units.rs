//! Conversions between base units and decimal display strings.

use crate::error::{DashboardError, Result};

/// Decimals of the chain's native currency.
pub const DECIMALS: u32 = 18;

const SCALE: u128 = 10u128.pow(DECIMALS);

/// Renders a base-unit amount as a decimal string, e.g. `1500000000000000000` -> `"1.5"`.
///
/// Trailing fractional zeros are dropped but one fractional digit is always kept.
pub fn format_units(value: u128) -> String {
    let whole = value / SCALE;
    let frac = value % SCALE;
    let mut frac_digits = format!("{:0width$}", frac, width = DECIMALS as usize);
    while frac_digits.len() > 1 && frac_digits.ends_with('0') {
        frac_digits.pop();
    }
    format!("{}.{}", whole, frac_digits)
}

/// Parses a decimal string into base units.
pub fn parse_units(text: &str) -> Result<u128> {
    let text = text.trim();
    if text.is_empty() {
        return Err(DashboardError::InvalidAmount("amount is required".into()));
    }
    if text.starts_with('-') {
        return Err(DashboardError::InvalidAmount(format!(
            "{} is negative",
            text
        )));
    }

    let (whole, frac) = match text.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (text, ""),
    };
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
        return Err(DashboardError::InvalidAmount(format!(
            "{} is not a number",
            text
        )));
    }
    if frac.len() > DECIMALS as usize {
        return Err(DashboardError::InvalidAmount(format!(
            "{} has more than {} decimal places",
            text, DECIMALS
        )));
    }

    let overflow = || DashboardError::InvalidAmount(format!("{} is too large", text));
    let whole_units = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().map_err(|_| overflow())?
    };
    let frac_units = if frac.is_empty() {
        0
    } else {
        let padded = format!("{:0<width$}", frac, width = DECIMALS as usize);
        padded.parse::<u128>().map_err(|_| overflow())?
    };

    whole_units
        .checked_mul(SCALE)
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// Serde adapter writing base-unit amounts as decimal strings.
pub mod base_units {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Short display form of an address: `0x1234...abcd`.
pub fn format_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 10 {
        return address.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_whole_and_fractional_amounts() {
        assert_eq!(format_units(0), "0.0");
        assert_eq!(format_units(1_000_000_000_000_000_000), "1.0");
        assert_eq!(format_units(1_500_000_000_000_000_000), "1.5");
        assert_eq!(format_units(1), "0.000000000000000001");
    }

    #[test]
    fn parses_decimal_strings() {
        assert_eq!(parse_units("1").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_units("0.25").unwrap(), 250_000_000_000_000_000);
        assert_eq!(parse_units(".5").unwrap(), 500_000_000_000_000_000);
        assert_eq!(parse_units(" 2. ").unwrap(), 2_000_000_000_000_000_000);
    }

    #[test]
    fn rejects_negative_and_non_numeric_input() {
        for bad in ["", "-1", "abc", "1.2.3", ".", "1e18", "0.0000000000000000001"] {
            assert!(
                matches!(parse_units(bad), Err(DashboardError::InvalidAmount(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overflowing_amounts() {
        assert!(parse_units("999999999999999999999999999").is_err());
    }

    #[test]
    fn round_trips_through_display_form() {
        let samples = [
            0u128,
            1,
            42,
            999_999_999_999_999_999,
            1_000_000_000_000_000_000,
            123_456_789_000_000_000_001,
            u128::MAX,
        ];
        for v in samples {
            assert_eq!(parse_units(&format_units(v)).unwrap(), v);
        }
    }

    #[test]
    fn shortens_addresses() {
        assert_eq!(
            format_address("0x1234567890abcdef1234567890abcdef12345678"),
            "0x1234...5678"
        );
        assert_eq!(format_address(""), "");
    }

    #[test]
    fn shortens_by_characters_not_bytes() {
        assert_eq!(format_address("ஊஊஊஊஊஊஊஊஊஊஊஊ"), "ஊஊஊஊஊஊ...ஊஊஊஊ");
        assert_eq!(format_address("é123456789"), "é123456789");
    }
}
