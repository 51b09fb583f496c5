//! Fixed-point money.
//!
//! The ledger never touches floating point. `Amount` stores a count of
//! hundredths (scale 2) in an `i128`. Debit paths truncate toward zero;
//! credit paths accept the caller's value as already rounded — the ledger
//! itself never rounds a credit, only rejects one that doesn't fit scale 2.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const SCALE: i128 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Construct from a count of hundredths directly (already scale-2).
    pub fn from_scaled(units: i128) -> Self {
        Amount(units)
    }

    pub fn scaled_units(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(&self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0).max(0))
    }

    /// Truncate a higher-precision on-chain integer amount down to scale 2,
    /// toward zero. Used on debit/sweep paths where we must never credit the
    /// user (or the hot wallet) more than actually moved on-chain.
    pub fn truncate_from_chain_units(units: u128, decimals: u8) -> Amount {
        if decimals as u32 <= 2 {
            let scale_up = 10u128.pow(2 - decimals as u32);
            return Amount((units.saturating_mul(scale_up)) as i128);
        }
        let divisor = 10u128.pow(decimals as u32 - 2);
        Amount((units / divisor) as i128)
    }

    /// Convert to on-chain integer units at the given decimals. This is the
    /// only place fixed-point money crosses into chain-adapter integers.
    pub fn to_chain_units(&self, decimals: u8) -> u128 {
        let units = self.0.max(0) as u128;
        if decimals as u32 <= 2 {
            let divisor = 10u128.pow(2 - decimals as u32);
            units / divisor.max(1)
        } else {
            let multiplier = 10u128.pow(decimals as u32 - 2);
            units * multiplier
        }
    }

    pub fn checked_mul_bps(&self, bps: u32) -> Option<Amount> {
        let scaled = self.0.checked_mul(bps as i128)?;
        Some(Amount(scaled / 10_000))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let negative = self.0 < 0;
        let abs = self.0.unsigned_abs();
        let whole = abs / SCALE as u128;
        let frac = abs % SCALE as u128;
        if negative {
            write!(f, "-{}.{:02}", whole, frac)
        } else {
            write!(f, "{}.{:02}", whole, frac)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AmountParseError {
    #[error("invalid decimal amount: {0}")]
    Invalid(String),
    #[error("amount has more than two fractional digits: {0}")]
    TooPrecise(String),
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let negative = s.starts_with('-');
        let unsigned = s.trim_start_matches('-');
        let mut parts = unsigned.splitn(2, '.');
        let whole_part = parts.next().unwrap_or("0");
        let frac_part = parts.next().unwrap_or("");

        if frac_part.len() > 2 {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }
        if whole_part.is_empty() && frac_part.is_empty() {
            return Err(AmountParseError::Invalid(s.to_string()));
        }

        let whole: i128 = whole_part
            .parse()
            .map_err(|_| AmountParseError::Invalid(s.to_string()))?;
        let mut frac_str = frac_part.to_string();
        while frac_str.len() < 2 {
            frac_str.push('0');
        }
        let frac: i128 = if frac_str.is_empty() {
            0
        } else {
            frac_str
                .parse()
                .map_err(|_| AmountParseError::Invalid(s.to_string()))?
        };

        let magnitude = whole * SCALE + frac;
        Ok(Amount(if negative { -magnitude } else { magnitude }))
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_round_trip() {
        let a: Amount = "5.00".parse().unwrap();
        assert_eq!(a.to_string(), "5.00");
        let b: Amount = "0.5".parse().unwrap();
        assert_eq!(b.to_string(), "0.50");
        let c: Amount = "-1.23".parse().unwrap();
        assert_eq!(c.to_string(), "-1.23");
    }

    #[test]
    fn rejects_overprecise_input() {
        assert!("1.234".parse::<Amount>().is_err());
    }

    #[test]
    fn truncates_chain_units_toward_zero() {
        // 18-decimal native token: 1.999999999999999999 MIND truncates to 1.99
        let units: u128 = 1_999_999_999_999_999_999;
        let amount = Amount::truncate_from_chain_units(units, 18);
        assert_eq!(amount.to_string(), "1.99");
    }

    #[test]
    fn chain_units_round_trip_for_round_amounts() {
        let a: Amount = "100.00".parse().unwrap();
        let units = a.to_chain_units(6); // USDT-style 6 decimals
        assert_eq!(units, 100_000_000);
        let back = Amount::truncate_from_chain_units(units, 6);
        assert_eq!(back, a);
    }

    #[test]
    fn bps_fee_computation() {
        let a: Amount = "50.00".parse().unwrap();
        let fee = a.checked_mul_bps(200).unwrap(); // 2%
        assert_eq!(fee.to_string(), "1.00");
    }
}
