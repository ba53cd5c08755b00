use std::{
    fmt::{self, Display, Formatter},
    iter::Sum,
    str::FromStr,
};

use primitive_types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid decimal amount: {0}")]
    InvalidDecimal(String),

    #[error("Amount overflow")]
    Overflow,

    #[error("Amount underflow")]
    Underflow,
}

// Balances, fees and vote weights are all arbitrary-precision.
// Persistence and the wire format use decimal strings, arithmetic
// happens on the underlying U256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::zero());

    pub fn from_u64(value: u64) -> Self {
        Amount(U256::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn checked_mul_u64(&self, factor: u64) -> Option<Amount> {
        self.0.checked_mul(U256::from(factor)).map(Amount)
    }

    // Integer division, used for fee averaging. Division by zero is a
    // caller bug, not a recoverable condition.
    pub fn div_u64(&self, divisor: u64) -> Amount {
        Amount(self.0 / U256::from(divisor))
    }

    // Number of decimal digits in the canonical string form
    pub fn digits(&self) -> usize {
        self.0.to_string().len()
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount::from_u64(value)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // U256 displays in decimal
        self.0.fmt(f)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::InvalidDecimal(s.to_string()));
        }
        U256::from_dec_str(s)
            .map(Amount)
            .map_err(|_| AmountError::InvalidDecimal(s.to_string()))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, v| {
            acc.checked_add(v).expect("amount sum overflowed U256")
        })
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_round_trip() {
        let amount: Amount = "10000000000000000000000000".parse().unwrap();
        assert_eq!(amount.to_string(), "10000000000000000000000000");
        assert_eq!(amount.digits(), 26);
    }

    #[test]
    fn test_rejects_non_decimal() {
        assert!("".parse::<Amount>().is_err());
        assert!("12a4".parse::<Amount>().is_err());
        assert!("-5".parse::<Amount>().is_err());
        assert!("1.5".parse::<Amount>().is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = Amount::from_u64(200);
        let b = Amount::from_u64(110);
        assert_eq!(a.checked_sub(b), Some(Amount::from_u64(90)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(a.checked_add(b), Some(Amount::from_u64(310)));
    }

    #[test]
    fn test_serde_uses_decimal_strings() {
        let amount = Amount::from_u64(1234);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"1234\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_fee_averaging() {
        let total = Amount::from_u64(70);
        assert_eq!(total.div_u64(3), Amount::from_u64(23));
    }
}
