//! Exact fixed-point cost arithmetic. Money is carried as integer USD micros
//! (6 decimal places); intermediate products use `i128` and the final values
//! are rounded half-to-even.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const USD_MICROS_PER_USD: u64 = 1_000_000;
const TOKENS_PER_MILLION: i128 = 1_000_000;
const BPS_PER_UNIT: i128 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("invalid decimal {raw:?}: {reason}")]
    InvalidDecimal { raw: String, reason: &'static str },
    #[error("decimal {raw:?} has more than {max_fraction_digits} fractional digits")]
    TooPrecise {
        raw: String,
        max_fraction_digits: u32,
    },
    #[error("cost of {input_tokens}in + {output_tokens}out tokens is out of range")]
    Overflow {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Provider cost and marked-up customer cost for one request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CostBreakdown {
    pub provider_cost_usd_micros: i64,
    pub vuzo_cost_usd_micros: i64,
}

/// `provider = in·pin/1e6 + out·pout/1e6` and `vuzo = provider·(1 + markup)`,
/// with the markup applied to the unrounded provider amount.
///
/// Prices are USD micros per million tokens; markup is in basis points of a
/// percent (`2000` is 20%).
pub fn compute_cost(
    input_tokens: u64,
    output_tokens: u64,
    input_usd_micros_per_million: u64,
    output_usd_micros_per_million: u64,
    markup_bps: u64,
) -> Result<CostBreakdown, PricingError> {
    let overflow = || PricingError::Overflow {
        input_tokens,
        output_tokens,
    };
    let input = i128::from(input_tokens).checked_mul(i128::from(input_usd_micros_per_million));
    let output = i128::from(output_tokens).checked_mul(i128::from(output_usd_micros_per_million));
    let provider_numerator = input
        .zip(output)
        .and_then(|(input, output)| input.checked_add(output))
        .ok_or_else(overflow)?;
    let vuzo_numerator = provider_numerator
        .checked_mul(BPS_PER_UNIT + i128::from(markup_bps))
        .ok_or_else(overflow)?;

    let provider = div_round_half_even(provider_numerator, TOKENS_PER_MILLION);
    let vuzo = div_round_half_even(vuzo_numerator, TOKENS_PER_MILLION * BPS_PER_UNIT);

    Ok(CostBreakdown {
        provider_cost_usd_micros: i64::try_from(provider).map_err(|_| overflow())?,
        vuzo_cost_usd_micros: i64::try_from(vuzo).map_err(|_| overflow())?,
    })
}

fn div_round_half_even(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let twice = remainder * 2;
    if twice > denominator || (twice == denominator && quotient % 2 != 0) {
        quotient + 1
    } else {
        quotient
    }
}

/// Parses a non-negative decimal string into an integer scaled by
/// `10^fraction_digits`. Extra fractional digits are accepted only when zero.
pub fn parse_scaled_decimal(raw: &str, fraction_digits: u32) -> Result<u64, PricingError> {
    let trimmed = raw.trim();
    let invalid = |reason| PricingError::InvalidDecimal {
        raw: raw.to_string(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if trimmed.starts_with('-') {
        return Err(invalid("negative"));
    }
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid("no digits"));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid("not a plain decimal"));
    }

    let significant = fraction.trim_end_matches('0');
    if significant.len() > fraction_digits as usize {
        return Err(PricingError::TooPrecise {
            raw: raw.to_string(),
            max_fraction_digits: fraction_digits,
        });
    }

    let scale = 10u64.pow(fraction_digits);
    let whole_value = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().map_err(|_| invalid("out of range"))?
    };
    let mut fraction_value = 0u64;
    for (index, digit) in significant.bytes().enumerate() {
        let place = 10u64.pow(fraction_digits - 1 - index as u32);
        fraction_value += u64::from(digit - b'0') * place;
    }

    whole_value
        .checked_mul(scale)
        .and_then(|value| value.checked_add(fraction_value))
        .ok_or_else(|| invalid("out of range"))
}

/// Renders USD micros as a fixed 6-decimal string, e.g. `0.000054`.
pub fn format_usd_micros(usd_micros: i64) -> String {
    let sign = if usd_micros < 0 { "-" } else { "" };
    let abs = usd_micros.unsigned_abs();
    format!(
        "{sign}{}.{:06}",
        abs / USD_MICROS_PER_USD,
        abs % USD_MICROS_PER_USD
    )
}

/// Decimal as written in config: a string, an integer, or a float. Floats are
/// read through their shortest round-trip rendering so `0.15` stays `0.15`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DecimalInput {
    Integer(u64),
    Float(f64),
    Text(String),
}

impl DecimalInput {
    fn into_text(self) -> String {
        match self {
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Text(value) => value,
        }
    }
}

/// Deserializes a USD decimal into USD micros.
pub fn deserialize_usd_micros<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = DecimalInput::deserialize(deserializer)?.into_text();
    parse_scaled_decimal(&raw, 6).map_err(serde::de::Error::custom)
}

/// Deserializes a percentage into basis points.
pub fn deserialize_percent_bps<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = DecimalInput::deserialize(deserializer)?.into_text();
    parse_scaled_decimal(&raw, 2).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIN: u64 = 150_000; // $0.15 / 1M
    const POUT: u64 = 600_000; // $0.60 / 1M

    #[test]
    fn worked_example_follows_the_formula() {
        let cost = compute_cost(100, 50, PIN, POUT, 2_000).expect("cost");
        assert_eq!(cost.provider_cost_usd_micros, 45);
        assert_eq!(cost.vuzo_cost_usd_micros, 54);
        assert_eq!(format_usd_micros(cost.vuzo_cost_usd_micros), "0.000054");
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(
            compute_cost(0, 0, PIN, POUT, 2_000).expect("cost"),
            CostBreakdown::default()
        );
        let one = compute_cost(1, 0, 3_000_000, POUT, 0).expect("cost");
        assert!(one.provider_cost_usd_micros > 0);
    }

    #[test]
    fn vuzo_cost_never_below_provider_cost() {
        for input in [0u64, 1, 7, 999, 12_345, 1_000_000, 987_654_321] {
            for output in [0u64, 3, 500, 77_777, 2_000_000] {
                for markup in [0u64, 1, 2_000, 2_550, 10_000] {
                    let cost = compute_cost(input, output, 2_500_000, 10_000_000, markup)
                        .expect("cost");
                    assert!(
                        cost.vuzo_cost_usd_micros >= cost.provider_cost_usd_micros,
                        "in={input} out={output} markup={markup}"
                    );
                }
            }
        }
    }

    #[test]
    fn markup_applies_to_unrounded_provider_cost() {
        // 3 input tokens at $0.15/1M is 0.45 micros: rounds to 0, but marked
        // up 100% it is 0.9 micros, which rounds to 1.
        let cost = compute_cost(3, 0, PIN, 0, 10_000).expect("cost");
        assert_eq!(cost.provider_cost_usd_micros, 0);
        assert_eq!(cost.vuzo_cost_usd_micros, 1);
    }

    #[test]
    fn absurd_prices_are_rejected_not_wrapped() {
        assert_eq!(
            compute_cost(u64::MAX, u64::MAX, u64::MAX, u64::MAX, 0),
            Err(PricingError::Overflow {
                input_tokens: u64::MAX,
                output_tokens: u64::MAX,
            })
        );
        assert!(matches!(
            compute_cost(u64::MAX, 0, u64::MAX / 2, 0, 2_000),
            Err(PricingError::Overflow { .. })
        ));
        // Fits in i128 but not in i64 micros.
        assert!(matches!(
            compute_cost(u64::MAX, 0, 1_000_000_000, 0, 0),
            Err(PricingError::Overflow { .. })
        ));
    }

    #[test]
    fn rounding_is_half_even() {
        assert_eq!(div_round_half_even(5, 10), 0);
        assert_eq!(div_round_half_even(15, 10), 2);
        assert_eq!(div_round_half_even(25, 10), 2);
        assert_eq!(div_round_half_even(26, 10), 3);
        assert_eq!(div_round_half_even(24, 10), 2);
    }

    #[test]
    fn parses_decimals_exactly() {
        assert_eq!(parse_scaled_decimal("0.15", 6), Ok(150_000));
        assert_eq!(parse_scaled_decimal("2.50", 6), Ok(2_500_000));
        assert_eq!(parse_scaled_decimal("20", 2), Ok(2_000));
        assert_eq!(parse_scaled_decimal(".5", 2), Ok(50));
        assert_eq!(parse_scaled_decimal("0.0000010", 6), Ok(1));
        assert!(matches!(
            parse_scaled_decimal("0.0000001", 6),
            Err(PricingError::TooPrecise { .. })
        ));
        assert!(matches!(
            parse_scaled_decimal("-1", 6),
            Err(PricingError::InvalidDecimal { .. })
        ));
        assert!(matches!(
            parse_scaled_decimal("1e-3", 6),
            Err(PricingError::InvalidDecimal { .. })
        ));
    }

    #[test]
    fn deserializes_strings_integers_and_floats() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_usd_micros")]
            price: u64,
            #[serde(deserialize_with = "deserialize_percent_bps")]
            markup: u64,
        }

        let row: Row = serde_json::from_str(r#"{"price": 0.15, "markup": 20}"#).expect("numbers");
        assert_eq!((row.price, row.markup), (150_000, 2_000));
        let row: Row =
            serde_json::from_str(r#"{"price": "10.00", "markup": "12.5"}"#).expect("strings");
        assert_eq!((row.price, row.markup), (10_000_000, 1_250));
    }

    #[test]
    fn formats_negative_balances() {
        assert_eq!(format_usd_micros(-1_500_000), "-1.500000");
        assert_eq!(format_usd_micros(1_000), "0.001000");
    }
}
